//! Split manifest loading, validation, indexing, and directory splitting.

use crate::types::{
    DatasetError, DatasetResult, IndexedTriplet, Split, SplitManifest, TripletRecord,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

impl SplitManifest {
    /// Load and validate a manifest. A relative (or missing) `root` resolves against the
    /// manifest's own directory.
    pub fn load(path: &Path) -> DatasetResult<Self> {
        let bytes = fs::read(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: SplitManifest =
            serde_json::from_slice(&bytes).map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        manifest.root = Some(match manifest.root.take() {
            Some(root) if root.is_absolute() => root,
            Some(root) => base.join(root),
            None => base.to_path_buf(),
        });
        manifest.validate(path)?;
        Ok(manifest)
    }

    /// Write the manifest as pretty JSON. A relative `root` is taken against the
    /// current directory and stored absolute, since `load` resolves relative roots
    /// against the manifest's directory instead.
    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let mut manifest = self.clone();
        if let Some(root) = manifest.root.as_mut().filter(|r| r.is_relative()) {
            let cwd = std::env::current_dir().map_err(|source| DatasetError::Io {
                path: root.clone(),
                source,
            })?;
            *root = cwd.join(&*root);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let json = serde_json::to_vec_pretty(&manifest).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override the image root (e.g. from `--ims-path`).
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn validate(&self, path: &Path) -> DatasetResult<()> {
        let fail = |msg: String| DatasetError::Validation {
            path: path.to_path_buf(),
            msg,
        };
        if self.products.is_empty() {
            return Err(fail("manifest lists no products".into()));
        }
        if self.categories.is_empty() {
            return Err(fail("manifest lists no categories".into()));
        }
        let categories: HashSet<&str> = self.categories.iter().map(String::as_str).collect();
        let products: HashSet<&str> = self.products.iter().map(String::as_str).collect();
        if categories.len() != self.categories.len() {
            return Err(fail("duplicate category names".into()));
        }
        if products.len() != self.products.len() {
            return Err(fail("duplicate product names".into()));
        }
        for split in [Split::Train, Split::Val, Split::Test] {
            for (i, rec) in self.records(split).iter().enumerate() {
                if rec.query.trim().is_empty() {
                    return Err(fail(format!("{split}[{i}] has an empty query path")));
                }
                if !categories.contains(rec.category.as_str()) {
                    return Err(fail(format!(
                        "{split}[{i}] category \"{}\" not in categories",
                        rec.category
                    )));
                }
                if !products.contains(rec.product.as_str()) {
                    return Err(fail(format!(
                        "{split}[{i}] product \"{}\" not in products",
                        rec.product
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn records(&self, split: Split) -> &[TripletRecord] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    /// Size of the product label space (class count for product supervision).
    pub fn num_products(&self) -> usize {
        self.products.len()
    }

    pub fn num_categories(&self) -> usize {
        self.categories.len()
    }

    /// Resolve paths and label indices for one split.
    pub fn index(&self, split: Split) -> DatasetResult<Vec<IndexedTriplet>> {
        let records = self.records(split);
        if records.is_empty() {
            return Err(DatasetError::EmptySplit { split });
        }
        let root = self.root();
        let cat_idx: HashMap<&str, usize> = self
            .categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        let prod_idx: HashMap<&str, usize> = self
            .products
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect();

        let mut out = Vec::with_capacity(records.len());
        for rec in records {
            let category = *cat_idx.get(rec.category.as_str()).ok_or_else(|| {
                DatasetError::Other(format!("unknown category {}", rec.category))
            })?;
            let product = *prod_idx
                .get(rec.product.as_str())
                .ok_or_else(|| DatasetError::Other(format!("unknown product {}", rec.product)))?;
            out.push(IndexedTriplet {
                query: root.join(&rec.query),
                positives: rec.positives.iter().map(|p| root.join(p)).collect(),
                category,
                product,
            });
        }
        let distinct: HashSet<usize> = out.iter().map(|t| t.product).collect();
        if distinct.len() < 2 {
            return Err(DatasetError::NoNegatives { split });
        }
        Ok(out)
    }
}

/// Fractions of each product's queries assigned to train/val/test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f32,
    pub val: f32,
    pub test: f32,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.8,
            val: 0.1,
            test: 0.1,
        }
    }
}

impl SplitRatios {
    fn normalized(self) -> DatasetResult<Self> {
        let parts = [self.train, self.val, self.test];
        if parts.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(DatasetError::Other(format!(
                "split ratios must be non-negative, got {self:?}"
            )));
        }
        let total: f32 = parts.iter().sum();
        if total <= 0.0 {
            return Err(DatasetError::Other("split ratios sum to zero".into()));
        }
        Ok(Self {
            train: self.train / total,
            val: self.val / total,
            test: self.test / total,
        })
    }

    /// (train, val, test) counts for `n` items; train keeps at least one item.
    pub fn counts(&self, n: usize) -> (usize, usize, usize) {
        if n == 0 {
            return (0, 0, 0);
        }
        let mut val = (n as f32 * self.val).round() as usize;
        let mut test = (n as f32 * self.test).round() as usize;
        while val + test >= n {
            if test > 0 && test >= val {
                test -= 1;
            } else if val > 0 {
                val -= 1;
            } else {
                break;
            }
        }
        (n - val - test, val, test)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_query_name(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            let s = s.to_ascii_lowercase();
            s.starts_with("query") || s.starts_with("sketch")
        })
        .unwrap_or(false)
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> DatasetResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let rd = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in rd {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() == want_dirs {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Scan `<root>/<category>/<product>/<images>` and distribute every product's queries over
/// train/val/test.
///
/// Images whose name starts with `query` or `sketch` are queries and the remaining images are
/// the product's positives. A product without such names uses every image as a query, with
/// the other images of the product as its positives.
pub fn build_manifest_from_dir(
    root: &Path,
    ratios: SplitRatios,
    seed: u64,
) -> DatasetResult<SplitManifest> {
    let ratios = ratios.normalized()?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut manifest = SplitManifest {
        root: Some(root.to_path_buf()),
        ..Default::default()
    };

    for cat_dir in sorted_entries(root, true)? {
        let category = relative(root, &cat_dir);
        let mut category_used = false;
        for prod_dir in sorted_entries(&cat_dir, true)? {
            let images: Vec<PathBuf> = sorted_entries(&prod_dir, false)?
                .into_iter()
                .filter(|p| is_image(p))
                .collect();
            if images.is_empty() {
                continue;
            }
            let product = relative(root, &prod_dir);
            let (queries, photos): (Vec<_>, Vec<_>) =
                images.iter().cloned().partition(|p| is_query_name(p));

            let mut records: Vec<TripletRecord> = if queries.is_empty() {
                images
                    .iter()
                    .map(|q| TripletRecord {
                        query: relative(root, q),
                        positives: images
                            .iter()
                            .filter(|p| *p != q)
                            .map(|p| relative(root, p))
                            .collect(),
                        category: category.clone(),
                        product: product.clone(),
                    })
                    .collect()
            } else {
                let positives: Vec<String> = photos.iter().map(|p| relative(root, p)).collect();
                queries
                    .iter()
                    .map(|q| TripletRecord {
                        query: relative(root, q),
                        positives: positives.clone(),
                        category: category.clone(),
                        product: product.clone(),
                    })
                    .collect()
            };
            records.shuffle(&mut rng);

            let (n_train, n_val, _) = ratios.counts(records.len());
            let mut rest = records.split_off(n_train);
            let test = rest.split_off(n_val);
            manifest.train.extend(records);
            manifest.val.extend(rest);
            manifest.test.extend(test);
            manifest.products.push(product);
            category_used = true;
        }
        if category_used {
            manifest.categories.push(category);
        }
    }

    if manifest.products.is_empty() {
        return Err(DatasetError::Validation {
            path: root.to_path_buf(),
            msg: "no <category>/<product>/ image folders found".into(),
        });
    }
    tracing::info!(
        categories = manifest.categories.len(),
        products = manifest.products.len(),
        train = manifest.train.len(),
        val = manifest.val.len(),
        test = manifest.test.len(),
        "built split manifest from {}",
        root.display()
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_keep_one_train_item() {
        let r = SplitRatios {
            train: 0.0,
            val: 0.5,
            test: 0.5,
        }
        .normalized()
        .unwrap();
        let (train, val, test) = r.counts(2);
        assert_eq!(train + val + test, 2);
        assert!(train >= 1);
    }

    #[test]
    fn counts_default_ratios() {
        let r = SplitRatios::default().normalized().unwrap();
        assert_eq!(r.counts(10), (8, 1, 1));
        assert_eq!(r.counts(1), (1, 0, 0));
        assert_eq!(r.counts(0), (0, 0, 0));
    }

    #[test]
    fn negative_ratio_rejected() {
        let r = SplitRatios {
            train: 1.0,
            val: -0.1,
            test: 0.0,
        };
        assert!(r.normalized().is_err());
    }

    #[test]
    fn query_names_detected() {
        assert!(is_query_name(Path::new("a/query_01.png")));
        assert!(is_query_name(Path::new("a/Sketch.PNG")));
        assert!(!is_query_name(Path::new("a/photo.png")));
        assert!(is_image(Path::new("x.JPG")));
        assert!(!is_image(Path::new("x.txt")));
    }

    #[test]
    fn relative_root_survives_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = SplitManifest {
            root: Some(PathBuf::from("imgs")),
            categories: vec!["chair".into()],
            products: vec!["c1".into()],
            train: vec![TripletRecord {
                query: "chair/c1/sketch_0.png".into(),
                positives: vec![],
                category: "chair".into(),
                product: "c1".into(),
            }],
            ..Default::default()
        };
        let path = tmp.path().join("data").join("splits.json");
        manifest.save(&path).unwrap();
        let loaded = SplitManifest::load(&path).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(loaded.root(), cwd.join("imgs"));
        assert_eq!(manifest.root, Some(PathBuf::from("imgs")));
    }

    #[test]
    fn listed_extensions_are_decodable() {
        for ext in IMAGE_EXTENSIONS {
            let format = image::ImageFormat::from_extension(ext)
                .unwrap_or_else(|| panic!("{ext} is not an image format"));
            assert!(format.reading_enabled(), "{ext} decoding is not enabled");
        }
    }
}
