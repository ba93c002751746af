use burn_ndarray::NdArray;
use std::fs;
use std::path::Path;
use triplet_dataset::{
    build_manifest_from_dir, LoaderConfig, RoleTransforms, Split, SplitManifest, SplitRatios,
    TripletLoader,
};

type B = NdArray<f32>;

fn write_image(path: &Path, shade: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = image::RgbImage::from_pixel(6, 5, image::Rgb([shade, shade / 2, 255 - shade]));
    img.save(path).unwrap();
}

fn synthetic_tree(root: &Path) {
    for (cat, prods) in [("chair", ["c1", "c2"]), ("table", ["t1", "t2"])] {
        for (j, prod) in prods.iter().enumerate() {
            let dir = root.join(cat).join(prod);
            for k in 0..4 {
                write_image(&dir.join(format!("sketch_{k}.png")), (j * 60 + k * 10) as u8);
            }
            write_image(&dir.join("photo_0.png"), 200);
            write_image(&dir.join("photo_1.png"), 180);
        }
    }
    // Empty product folders are ignored.
    fs::create_dir_all(root.join("table").join("empty")).unwrap();
}

#[test]
fn split_build_save_load_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_tree(tmp.path());

    let ratios = SplitRatios {
        train: 0.5,
        val: 0.25,
        test: 0.25,
    };
    let manifest = build_manifest_from_dir(tmp.path(), ratios, 42).unwrap();
    assert_eq!(manifest.categories, vec!["chair", "table"]);
    assert_eq!(manifest.num_products(), 4);
    assert_eq!(manifest.train.len(), 8);
    assert_eq!(manifest.val.len(), 4);
    assert_eq!(manifest.test.len(), 4);
    for rec in &manifest.train {
        assert!(rec.query.contains("sketch_"));
        assert_eq!(rec.positives.len(), 2);
        assert!(rec.positives.iter().all(|p| p.starts_with(&rec.product)));
    }

    let path = tmp.path().join("splits").join("manifest.json");
    manifest.save(&path).unwrap();
    let loaded = SplitManifest::load(&path).unwrap();
    assert_eq!(loaded.products, manifest.products);
    assert_eq!(loaded.root(), tmp.path());

    // Same seed, same split.
    let again = build_manifest_from_dir(tmp.path(), ratios, 42).unwrap();
    assert_eq!(again.train, manifest.train);
}

#[test]
fn loader_yields_full_batches_with_labels() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_tree(tmp.path());
    let manifest = build_manifest_from_dir(tmp.path(), SplitRatios::default(), 1).unwrap();
    let triplets = manifest.index(Split::Train).unwrap();
    let total = triplets.len();

    let cfg = LoaderConfig {
        batch_size: 3,
        shuffle: true,
        drop_last: true,
        random_pairs: true,
        seed: Some(9),
    };
    let mut loader =
        TripletLoader::new(triplets, cfg, RoleTransforms::sketch_default((8, 8))).unwrap();
    let device = Default::default();

    let mut seen = 0;
    let mut batches = 0;
    while let Some(batch) = loader.next_batch::<B>(&device).unwrap() {
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.queries.dims(), [3, 3, 8, 8]);
        assert_eq!(batch.negatives.dims(), [3, 3, 8, 8]);
        assert_eq!(batch.products.dims(), [3]);
        assert!(batch.product_ids.iter().all(|p| *p < manifest.num_products()));
        seen += batch.len();
        batches += 1;
    }
    assert_eq!(batches, loader.num_batches());
    assert_eq!(seen, (total / 3) * 3);

    loader.reset();
    assert!(loader.next_batch::<B>(&device).unwrap().is_some());
}

#[test]
fn manifest_with_unknown_product_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bad.json");
    fs::write(
        &path,
        r#"{"categories":["a"],"products":["a/1","a/2"],
            "train":[{"query":"q.png","category":"a","product":"a/9"}]}"#,
    )
    .unwrap();
    let err = SplitManifest::load(&path).unwrap_err();
    assert!(err.to_string().contains("a/9"));
}

#[test]
fn missing_split_reports_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("m.json");
    fs::write(
        &path,
        r#"{"categories":["a"],"products":["a/1","a/2"],
            "train":[{"query":"q.png","category":"a","product":"a/1"}]}"#,
    )
    .unwrap();
    let manifest = SplitManifest::load(&path).unwrap();
    assert!(manifest.index(Split::Test).is_err());
    // One product only: no negatives available.
    assert!(manifest.index(Split::Train).is_err());
}
