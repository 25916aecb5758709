//! On-disk raster storage.
//!
//! Images live under a data directory in three buckets: `uploads/` for user
//! uploads, `results/` for annotated output and `captures/` for frames pulled
//! from the live stream or a remote camera. Records refer to files by a
//! relative reference such as `uploads/3f9c....png`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use image::RgbImage;
use rand::RngCore;

use crate::annotate::encode_jpeg;
use crate::error::{Error, Result};

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "webp"];
pub const RESULT_JPEG_QUALITY: u8 = 90;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Uploads,
    Results,
    Captures,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Uploads, Bucket::Results, Bucket::Captures];

    fn dir_name(self) -> &'static str {
        match self {
            Bucket::Uploads => "uploads",
            Bucket::Results => "results",
            Bucket::Captures => "captures",
        }
    }
}

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for bucket in Bucket::ALL {
            fs::create_dir_all(root.join(bucket.dir_name()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under a fresh random name and return its reference.
    pub fn save_bytes(&self, bucket: Bucket, prefix: &str, ext: &str, bytes: &[u8]) -> Result<String> {
        let reference = format!("{}/{}{}.{}", bucket.dir_name(), prefix, random_name(), ext);
        write_atomic(&self.root.join(&reference), bytes)?;
        Ok(reference)
    }

    pub fn save_jpeg(&self, bucket: Bucket, prefix: &str, image: &RgbImage) -> Result<String> {
        let bytes = encode_jpeg(image, RESULT_JPEG_QUALITY)?;
        self.save_bytes(bucket, prefix, "jpg", &bytes)
    }

    /// Absolute path for a stored reference. References that escape the data
    /// directory are rejected.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let rel = Path::new(reference);
        let clean = rel
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if reference.is_empty() || !clean {
            return Err(Error::Validation(format!(
                "invalid image reference {:?}",
                reference
            )));
        }
        Ok(self.root.join(rel))
    }

    pub fn read(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve(reference)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("image {} not found", reference)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a stored image. A file that is already gone is not an error.
    pub fn remove(&self, reference: &str) -> Result<()> {
        let path = self.resolve(reference)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn load_rgb(&self, reference: &str) -> Result<RgbImage> {
        decode_image(&self.read(reference)?)
    }
}

/// Decode any supported raster format into packed RGB8.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(Error::Validation("image payload is empty".into()));
    }
    Ok(image::load_from_memory(bytes)?.into_rgb8())
}

/// Lower-cased extension of `filename` if it is an accepted upload type.
pub fn allowed_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

pub fn content_type_for(reference: &str) -> &'static str {
    match reference
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn random_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_under_buckets_with_unique_names() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = ImageStore::new(temp_dir.path())?;
        let a = store.save_bytes(Bucket::Uploads, "", "png", b"one")?;
        let b = store.save_bytes(Bucket::Uploads, "", "png", b"two")?;
        assert_ne!(a, b);
        assert!(a.starts_with("uploads/") && a.ends_with(".png"));
        assert_eq!(store.read(&a)?, b"one");

        let entries = fs::read_dir(temp_dir.path().join("uploads"))?.count();
        assert_eq!(entries, 2);
        Ok(())
    }

    #[test]
    fn rejects_escaping_references() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = ImageStore::new(temp_dir.path())?;
        for bad in ["../secret", "/etc/passwd", "uploads/../../x", ""] {
            let err = store.read(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Validation, "{}", bad);
        }
        let err = store.read("uploads/missing.png").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn remove_deletes_once_and_tolerates_missing() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = ImageStore::new(temp_dir.path())?;
        let reference = store.save_bytes(Bucket::Results, "result_", "jpg", b"jpeg")?;
        store.remove(&reference)?;
        assert_eq!(
            store.read(&reference).unwrap_err().kind(),
            crate::ErrorKind::NotFound
        );
        store.remove(&reference)?;
        assert_eq!(
            store.remove("../outside.jpg").unwrap_err().kind(),
            crate::ErrorKind::Validation
        );
        Ok(())
    }

    #[test]
    fn jpeg_results_decode_back() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = ImageStore::new(temp_dir.path())?;
        let reference = store.save_jpeg(Bucket::Results, "result_", &RgbImage::new(40, 30))?;
        assert!(reference.starts_with("results/result_"));
        let image = store.load_rgb(&reference)?;
        assert_eq!(image.dimensions(), (40, 30));
        Ok(())
    }

    #[test]
    fn extension_filter_matches_upload_types() {
        assert_eq!(allowed_extension("beans.JPG").as_deref(), Some("jpg"));
        assert_eq!(allowed_extension("a.b.webp").as_deref(), Some("webp"));
        assert_eq!(allowed_extension("notes.txt"), None);
        assert_eq!(allowed_extension("noext"), None);
        assert_eq!(content_type_for("results/x.jpg"), "image/jpeg");
    }

    #[test]
    fn garbage_bytes_are_image_errors() {
        assert_eq!(
            decode_image(b"not an image").unwrap_err().kind(),
            crate::ErrorKind::Image
        );
        assert_eq!(
            decode_image(&[]).unwrap_err().kind(),
            crate::ErrorKind::Validation
        );
    }
}
