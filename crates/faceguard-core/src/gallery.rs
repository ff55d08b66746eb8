//! In-process verifier over a directory of reference images.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::detector::FaceDetector;
use crate::recognizer::FaceEmbedder;
use crate::types::{BoundingBox, DistanceMetric, Embedding, MatchCandidate};
use crate::verifier::{VerificationService, VerifyError, VerifyParams};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const SUPPORTED_MODEL: &str = "arcface";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// ArcFace match cutoffs applied before rows are returned. Embeddings are
/// unit vectors, so plain euclidean and euclidean-L2 share one cutoff.
const COSINE_CUTOFF: f32 = 0.68;
const EUCLIDEAN_L2_CUTOFF: f32 = 1.13;

/// Turns a face crop into an embedding.
pub trait FaceEncoder: Send {
    fn encode(&mut self, face: &RgbImage) -> Result<Embedding, VerifyError>;
}

impl FaceEncoder for FaceEmbedder {
    fn encode(&mut self, face: &RgbImage) -> Result<Embedding, VerifyError> {
        Ok(self.embed(face)?)
    }
}

/// Finds faces in an image, best first.
pub trait FaceLocator: Send {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VerifyError>;
}

impl FaceLocator for FaceDetector {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VerifyError> {
        Ok(self.detect(image)?)
    }
}

/// How a face crop is obtained from a whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorBackend {
    /// The whole image is the face.
    Skip,
    /// SCRFD detection, then landmark alignment.
    Scrfd,
}

struct CachedEmbedding {
    modified: SystemTime,
    backend: DetectorBackend,
    /// `None` when no face was found in the reference image.
    embedding: Option<Embedding>,
}

/// Embeds the probe and every gallery image with ArcFace and reports the
/// references within the match cutoff, in path order. A probe without a
/// detectable face yields no rows. Gallery embeddings are cached until the
/// file's modification time changes.
pub struct GalleryVerifier {
    encoder: Box<dyn FaceEncoder>,
    locator: Option<Box<dyn FaceLocator>>,
    cache: HashMap<PathBuf, CachedEmbedding>,
}

impl GalleryVerifier {
    pub fn new(encoder: impl FaceEncoder + 'static) -> Self {
        Self {
            encoder: Box::new(encoder),
            locator: None,
            cache: HashMap::new(),
        }
    }

    /// Enable `detector_backend = "scrfd"`.
    pub fn with_locator(mut self, locator: impl FaceLocator + 'static) -> Self {
        self.locator = Some(Box::new(locator));
        self
    }

    fn check_params(&self, params: &VerifyParams) -> Result<(DistanceMetric, DetectorBackend), VerifyError> {
        if !params.model_name.eq_ignore_ascii_case(SUPPORTED_MODEL) {
            return Err(VerifyError::Unsupported {
                option: "model_name",
                value: params.model_name.clone(),
            });
        }
        let backend = match params.detector_backend.to_ascii_lowercase().as_str() {
            "skip" => DetectorBackend::Skip,
            "scrfd" if self.locator.is_some() => DetectorBackend::Scrfd,
            _ => {
                return Err(VerifyError::Unsupported {
                    option: "detector_backend",
                    value: params.detector_backend.clone(),
                })
            }
        };
        let metric = DistanceMetric::parse(&params.distance_metric).ok_or_else(|| {
            VerifyError::Unsupported {
                option: "distance_metric",
                value: params.distance_metric.clone(),
            }
        })?;
        Ok((metric, backend))
    }

    /// Face crop for `image`, or `None` if the backend finds no face.
    fn face_crop(&mut self, image: RgbImage, backend: DetectorBackend) -> Result<Option<RgbImage>, VerifyError> {
        let locator = match (backend, self.locator.as_mut()) {
            (DetectorBackend::Skip, _) | (DetectorBackend::Scrfd, None) => return Ok(Some(image)),
            (DetectorBackend::Scrfd, Some(locator)) => locator,
        };
        let Some(face) = locator.locate(&image)?.into_iter().next() else {
            return Ok(None);
        };
        let aligned = face.landmarks.and_then(|landmarks| align_face(&image, &landmarks));
        Ok(aligned.or_else(|| crop_box(&image, &face)))
    }

    fn embed_image(&mut self, image: RgbImage, backend: DetectorBackend) -> Result<Option<Embedding>, VerifyError> {
        match self.face_crop(image, backend)? {
            Some(face) => Ok(Some(self.encoder.encode(&face)?)),
            None => Ok(None),
        }
    }

    fn gallery_embedding(
        &mut self,
        path: &Path,
        backend: DetectorBackend,
    ) -> Result<Option<&Embedding>, VerifyError> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| VerifyError::Gallery {
                path: path.to_path_buf(),
                source,
            })?;

        let fresh = self
            .cache
            .get(path)
            .is_some_and(|cached| cached.modified == modified && cached.backend == backend);
        if !fresh {
            let image = match image::open(path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable gallery image");
                    return Ok(None);
                }
            };
            let embedding = self.embed_image(image, backend)?;
            if embedding.is_none() {
                tracing::warn!(path = %path.display(), "no face in gallery image");
            }
            self.cache.insert(
                path.to_path_buf(),
                CachedEmbedding {
                    modified,
                    backend,
                    embedding,
                },
            );
        }
        Ok(self.cache.get(path).and_then(|cached| cached.embedding.as_ref()))
    }
}

impl VerificationService for GalleryVerifier {
    fn find(
        &mut self,
        probe: &Path,
        gallery: &Path,
        params: &VerifyParams,
    ) -> Result<Vec<MatchCandidate>, VerifyError> {
        let (metric, backend) = self.check_params(params)?;

        let probe_image = image::open(probe)
            .map_err(|e| VerifyError::Probe {
                path: probe.to_path_buf(),
                message: e.to_string(),
            })?
            .to_rgb8();
        let Some(probe_embedding) = self.embed_image(probe_image, backend)? else {
            tracing::debug!(probe = %probe.display(), "no face in probe");
            return Ok(Vec::new());
        };

        let cutoff = match_cutoff(metric);
        let references = list_gallery_images(gallery)?;
        let mut candidates = Vec::new();
        for reference in &references {
            let Some(embedding) = self.gallery_embedding(reference, backend)? else {
                continue;
            };
            let distance = probe_embedding.distance(embedding, metric);
            if distance <= cutoff {
                candidates.push(MatchCandidate::new(reference.display().to_string(), distance));
            }
        }

        tracing::debug!(
            gallery = %gallery.display(),
            references = references.len(),
            candidates = candidates.len(),
            cutoff,
            "gallery search finished"
        );
        Ok(candidates)
    }
}

fn match_cutoff(metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Cosine => COSINE_CUTOFF,
        DistanceMetric::Euclidean | DistanceMetric::EuclideanL2 => EUCLIDEAN_L2_CUTOFF,
    }
}

/// Square-resized crop of the box, for detections without landmarks.
fn crop_box(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let x = face.x.max(0.0) as u32;
    let y = face.y.max(0.0) as u32;
    let right = ((face.x + face.width).max(0.0) as u32).min(image.width());
    let bottom = ((face.y + face.height).max(0.0) as u32).min(image.height());
    if right <= x || bottom <= y {
        return None;
    }
    let crop = imageops::crop_imm(image, x, y, right - x, bottom - y).to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

/// All reference images under `gallery`, recursively, sorted by path.
pub fn list_gallery_images(gallery: &Path) -> Result<Vec<PathBuf>, VerifyError> {
    let mut found = Vec::new();
    collect_images(gallery, &mut found).map_err(|source| VerifyError::Gallery {
        path: gallery.to_path_buf(),
        source,
    })?;
    found.sort();
    Ok(found)
}

fn collect_images(dir: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, found)?;
        } else if has_image_extension(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

    /// Embeds a crop as its mean colour, so same-coloured images match.
    #[derive(Clone, Default)]
    struct ColourEncoder {
        calls: Arc<AtomicUsize>,
    }

    impl FaceEncoder for ColourEncoder {
        fn encode(&mut self, face: &RgbImage) -> Result<Embedding, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut sums = [0.0f32; 3];
            for pixel in face.pixels() {
                for c in 0..3 {
                    sums[c] += pixel[c] as f32;
                }
            }
            Ok(Embedding {
                values: sums.to_vec(),
                model_version: None,
            })
        }
    }

    /// Returns a fixed detection list and records the sizes it was shown.
    struct FixedLocator {
        faces: Vec<BoundingBox>,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VerifyError> {
            self.seen.lock().unwrap().push(image.dimensions());
            Ok(self.faces.clone())
        }
    }

    fn params(model: &str, detector: &str, metric: &str) -> VerifyParams {
        VerifyParams {
            model_name: model.into(),
            detector_backend: detector.into(),
            distance_metric: metric.into(),
        }
    }

    fn write_image(path: &Path, colour: Rgb<u8>) {
        RgbImage::from_pixel(16, 16, colour).save(path).unwrap();
    }

    /// alice (red), bob (green), carol/carol (red), plus noise files.
    fn gallery() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("alice.png"), RED);
        write_image(&dir.path().join("bob.png"), GREEN);
        fs::create_dir(dir.path().join("carol")).unwrap();
        write_image(&dir.path().join("carol").join("carol.png"), RED);
        fs::write(dir.path().join("broken.jpg"), b"not an image").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        dir
    }

    fn probe(dir: &Path, colour: Rgb<u8>) -> PathBuf {
        let path = dir.join("probe.png");
        write_image(&path, colour);
        path
    }

    fn names(candidates: &[MatchCandidate], root: &Path) -> Vec<String> {
        candidates
            .iter()
            .map(|c| {
                Path::new(&c.identity)
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_list_gallery_images_recurses_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bob.JPG"), b"x").unwrap();
        fs::write(dir.path().join("alice.png"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("carol")).unwrap();
        fs::write(dir.path().join("carol").join("carol.jpeg"), b"x").unwrap();

        let images = list_gallery_images(dir.path()).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alice.png", "bob.JPG", "carol/carol.jpeg"]);
    }

    #[test]
    fn test_missing_gallery_is_an_error() {
        let result = list_gallery_images(Path::new("/nonexistent/known_faces"));
        assert!(matches!(result, Err(VerifyError::Gallery { .. })));
    }

    #[test]
    fn test_check_params() {
        let verifier = GalleryVerifier::new(ColourEncoder::default());
        assert_eq!(
            verifier.check_params(&params("ArcFace", "skip", "cosine")).unwrap(),
            (DistanceMetric::Cosine, DetectorBackend::Skip)
        );
        assert!(matches!(
            verifier.check_params(&params("Facenet", "skip", "cosine")),
            Err(VerifyError::Unsupported { option: "model_name", .. })
        ));
        assert!(matches!(
            verifier.check_params(&params("ArcFace", "mtcnn", "cosine")),
            Err(VerifyError::Unsupported { option: "detector_backend", .. })
        ));
        // No detector loaded.
        assert!(matches!(
            verifier.check_params(&params("ArcFace", "scrfd", "cosine")),
            Err(VerifyError::Unsupported { option: "detector_backend", .. })
        ));
        assert!(matches!(
            verifier.check_params(&params("ArcFace", "skip", "angular")),
            Err(VerifyError::Unsupported { option: "distance_metric", .. })
        ));
    }

    #[test]
    fn test_find_returns_matches_in_path_order() {
        let gallery = gallery();
        let scratch = tempfile::tempdir().unwrap();
        let mut verifier = GalleryVerifier::new(ColourEncoder::default());

        let found = verifier
            .find(&probe(scratch.path(), RED), gallery.path(), &params("ArcFace", "skip", "cosine"))
            .unwrap();

        assert_eq!(names(&found, gallery.path()), vec!["alice.png", "carol/carol.png"]);
        assert!(found.iter().all(|c| c.distance.is_some_and(|d| d < 1e-6)));
    }

    #[test]
    fn test_unrelated_face_matches_nothing() {
        let gallery = gallery();
        let scratch = tempfile::tempdir().unwrap();
        let mut verifier = GalleryVerifier::new(ColourEncoder::default());

        // Orthogonal to every reference: cosine distance 1.0, inside the
        // decision threshold but outside the match cutoff.
        for metric in ["cosine", "euclidean_l2"] {
            let found = verifier
                .find(&probe(scratch.path(), BLUE), gallery.path(), &params("ArcFace", "skip", metric))
                .unwrap();
            assert!(found.is_empty(), "{metric}: {found:?}");
        }
    }

    #[test]
    fn test_gallery_cache_follows_mtime() {
        let gallery = gallery();
        let scratch = tempfile::tempdir().unwrap();
        let encoder = ColourEncoder::default();
        let calls = Arc::clone(&encoder.calls);
        let mut verifier = GalleryVerifier::new(encoder);
        let probe = probe(scratch.path(), GREEN);
        let params = params("ArcFace", "skip", "cosine");

        let found = verifier.find(&probe, gallery.path(), &params).unwrap();
        assert_eq!(names(&found, gallery.path()), vec!["bob.png"]);
        // Probe plus three readable references.
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        verifier.find(&probe, gallery.path(), &params).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let bob = gallery.path().join("bob.png");
        write_image(&bob, RED);
        fs::File::options()
            .write(true)
            .open(&bob)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let found = verifier.find(&probe, gallery.path(), &params).unwrap();
        assert!(found.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_faceless_image_yields_no_rows() {
        let gallery = gallery();
        let scratch = tempfile::tempdir().unwrap();
        let encoder = ColourEncoder::default();
        let calls = Arc::clone(&encoder.calls);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut verifier = GalleryVerifier::new(encoder).with_locator(FixedLocator {
            faces: Vec::new(),
            seen: Arc::clone(&seen),
        });

        let found = verifier
            .find(&probe(scratch.path(), RED), gallery.path(), &params("ArcFace", "scrfd", "cosine"))
            .unwrap();

        assert!(found.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_detected_face_is_cropped_before_encoding() {
        let gallery = gallery();
        let scratch = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let face = BoundingBox {
            x: 2.0,
            y: 2.0,
            width: 8.0,
            height: 8.0,
            confidence: 0.9,
            landmarks: None,
        };
        let mut verifier = GalleryVerifier::new(ColourEncoder::default()).with_locator(FixedLocator {
            faces: vec![face],
            seen: Arc::clone(&seen),
        });

        let found = verifier
            .find(&probe(scratch.path(), RED), gallery.path(), &params("ArcFace", "scrfd", "cosine"))
            .unwrap();

        assert_eq!(names(&found, gallery.path()), vec!["alice.png", "carol/carol.png"]);
        // Probe plus the three readable references went through detection.
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_crop_box_outside_image() {
        let image = RgbImage::new(16, 16);
        let outside = BoundingBox {
            x: 20.0,
            y: 20.0,
            width: 5.0,
            height: 5.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert!(crop_box(&image, &outside).is_none());
        let inside = BoundingBox { x: 0.0, y: 0.0, ..outside };
        assert_eq!(crop_box(&image, &inside).unwrap().dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }
}
