//! IDX (MNIST) reader and the in-memory training set.
//!
//! # File Format
//!
//! Both files start with big-endian `u32` fields:
//!
//! - images: `magic = 2051`, `count`, `rows`, `cols`, then
//!   `count * rows * cols` unsigned bytes
//! - labels: `magic = 2049`, `count`, then `count` unsigned bytes
//!
//! Paths ending in `.gz` are decompressed on the fly with `flate2`.
//!
//! A missing file, a wrong magic number or a file shorter than its header
//! promises is an [`OcrError::Io`]; the loaders never return partial data.
//!
//! # Example
//!
//! ```no_run
//! use simple_ocr::dataset::{Dataset, load_mnist_images, load_mnist_labels};
//!
//! let images = load_mnist_images("data/train-images-idx3-ubyte.gz")?;
//! let labels = load_mnist_labels("data/train-labels-idx1-ubyte.gz")?;
//! let train = Dataset::from_mnist(&images, &labels)?;
//! assert_eq!(train.input_dim(), Some(28 * 28));
//! # Ok::<(), simple_ocr::error::OcrError>(())
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::debug;

use crate::error::{OcrError, Result};

/// Magic number of an IDX image file.
pub const IMAGE_MAGIC: u32 = 2051;
/// Magic number of an IDX label file.
pub const LABEL_MAGIC: u32 = 2049;

/// Raw images as read from an IDX file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    /// Pixel rows per image.
    pub rows: usize,
    /// Pixel columns per image.
    pub cols: usize,
    /// One `rows * cols` byte vector per image, row-major.
    pub images: Vec<Vec<u8>>,
}

impl ImageSet {
    /// Number of images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// `true` if the file declared zero images.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated IDX file: {what} needs {n} bytes at offset {}", self.pos),
                )
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn u32_be(&mut self, what: &str) -> io::Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn usize_be(&mut self, what: &str) -> io::Result<usize> {
        let v = self.u32_be(what)?;
        usize::try_from(v).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("{what} too large")))
    }
}

fn expect_magic(reader: &mut ByteReader<'_>, expected: u32) -> io::Result<()> {
    let magic = reader.u32_be("magic")?;
    if magic != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad IDX magic number {magic}, expected {expected}"),
        ));
    }
    Ok(())
}

fn read_all(path: &Path) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

/// Parses an in-memory IDX image file.
///
/// # Errors
/// [`OcrError::Io`] with [`io::ErrorKind::InvalidData`] for a wrong magic
/// number or a zero row/column count, or [`io::ErrorKind::UnexpectedEof`]
/// if the payload is shorter than the header declares.
pub fn parse_images(bytes: &[u8]) -> Result<ImageSet> {
    let mut reader = ByteReader::new(bytes);
    expect_magic(&mut reader, IMAGE_MAGIC)?;
    let count = reader.usize_be("image count")?;
    let rows = reader.usize_be("rows")?;
    let cols = reader.usize_be("cols")?;
    if rows == 0 || cols == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("empty image size {rows}x{cols}")).into());
    }
    let pixels = rows
        .checked_mul(cols)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "image size overflows"))?;
    // reject before allocating: the header alone may claim millions of images
    if count.checked_mul(pixels).is_none_or(|n| n > reader.remaining()) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "truncated IDX file: {count} images of {rows}x{cols} do not fit in {} bytes",
                reader.remaining()
            ),
        )
        .into());
    }

    let mut images = Vec::with_capacity(count);
    for i in 0..count {
        images.push(reader.take(pixels, &format!("image {i}"))?.to_vec());
    }
    Ok(ImageSet { rows, cols, images })
}

/// Parses an in-memory IDX label file.
///
/// # Errors
/// As for [`parse_images`].
pub fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(bytes);
    expect_magic(&mut reader, LABEL_MAGIC)?;
    let count = reader.usize_be("label count")?;
    Ok(reader.take(count, "labels")?.to_vec())
}

/// Reads an IDX image file, gzip-compressed if the name ends in `.gz`.
///
/// # Errors
/// [`OcrError::Io`] if the file is missing, malformed or truncated.
pub fn load_mnist_images(path: impl AsRef<Path>) -> Result<ImageSet> {
    let path = path.as_ref();
    let set = parse_images(&read_all(path)?)?;
    debug!(
        "loaded {} images of {}x{} from {}",
        set.len(),
        set.rows,
        set.cols,
        path.display()
    );
    Ok(set)
}

/// Reads an IDX label file, gzip-compressed if the name ends in `.gz`.
///
/// # Errors
/// [`OcrError::Io`] if the file is missing, malformed or truncated.
pub fn load_mnist_labels(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let labels = parse_labels(&read_all(path)?)?;
    debug!("loaded {} labels from {}", labels.len(), path.display());
    Ok(labels)
}

/// Scales raw pixels into `[0, 1]`.
#[must_use]
pub fn image_to_input(pixels: &[u8]) -> Vec<f32> {
    pixels.iter().map(|&p| f32::from(p) / 255.0).collect()
}

/// Labeled input vectors ready for training.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    inputs: Vec<Vec<f32>>,
    labels: Vec<usize>,
}

impl Dataset {
    /// Pairs `inputs` with `labels`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if the counts differ or the inputs are
    /// not all the same length.
    pub fn new(inputs: Vec<Vec<f32>>, labels: Vec<usize>) -> Result<Self> {
        if inputs.len() != labels.len() {
            return Err(OcrError::mismatch("Dataset::new: labels", inputs.len(), labels.len()));
        }
        if let Some(first) = inputs.first() {
            let dim = first.len();
            if let Some(bad) = inputs.iter().find(|x| x.len() != dim) {
                return Err(OcrError::mismatch("Dataset::new: input length", dim, bad.len()));
            }
        }
        Ok(Self { inputs, labels })
    }

    /// Normalises an IDX image set and pairs it with its labels.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if the image and label counts differ.
    pub fn from_mnist(images: &ImageSet, labels: &[u8]) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(OcrError::mismatch("Dataset::from_mnist", images.len(), labels.len()));
        }
        let inputs = images.images.iter().map(|img| image_to_input(img)).collect();
        let labels = labels.iter().map(|&l| usize::from(l)).collect();
        Self::new(inputs, labels)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// `true` if there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Length of every input vector, `None` when empty.
    #[must_use]
    pub fn input_dim(&self) -> Option<usize> {
        self.inputs.first().map(Vec::len)
    }

    /// Input vectors.
    #[must_use]
    pub fn inputs(&self) -> &[Vec<f32>] {
        &self.inputs
    }

    /// Class labels.
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Sample `i` as `(input, label)`.
    #[must_use]
    pub fn sample(&self, i: usize) -> Option<(&[f32], usize)> {
        Some((self.inputs.get(i)?.as_slice(), *self.labels.get(i)?))
    }

    /// The first `n` samples (all of them if `n >= len`).
    #[must_use]
    pub fn take(&self, n: usize) -> Self {
        let n = n.min(self.len());
        Self {
            inputs: self.inputs[..n].to_vec(),
            labels: self.labels[..n].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixels_scale_to_unit_interval() {
        assert_eq!(image_to_input(&[0, 255]), vec![0.0, 1.0]);
    }

    #[test]
    fn short_label_file_is_eof() {
        let mut bytes = LABEL_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2]);
        match parse_labels(&bytes) {
            Err(OcrError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    #[test]
    fn dataset_rejects_ragged_inputs() {
        assert!(Dataset::new(vec![vec![0.0; 2], vec![0.0; 3]], vec![0, 1]).is_err());
        assert!(Dataset::new(vec![vec![0.0; 2]], vec![0, 1]).is_err());
    }
}
