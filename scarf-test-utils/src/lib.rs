mod common;
pub use common::*;

use scarf::backend::{DatasetOp, GroupOp, ScalarType};
use scarf::data::{Column, DynScalar, Shape};
use scarf::*;

use ndarray::{array, s, Array2, Axis};
use polars::prelude::{DataFrame, NamedFrom, Series};
use proptest::prelude::*;

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .for_each(|(x, y)| assert!((x - y).abs() < 1e-6, "{} != {}", x, y));
}

fn tenx_features() -> Vec<(String, String, String)> {
    [
        ("g1", "MT-CO1", "Gene Expression"),
        ("g2", "RPL3", "Gene Expression"),
        ("g3", "ACTB", "Gene Expression"),
        ("a1", "CD3", "Antibody Capture"),
        ("a2", "CD4", "Antibody Capture"),
    ]
    .iter()
    .map(|(a, b, c)| (a.to_string(), b.to_string(), c.to_string()))
    .collect()
}

pub fn test_convert<B: Backend>() {
    with_tmp_dir(|dir| {
        let data = TenxData {
            barcodes: cell_ids(7),
            features: tenx_features(),
            counts: rand_counts(5, 7, 10),
        };
        let all: Vec<usize> = (0..7).collect();
        for gz in [false, true] {
            let input = dir.join(format!("input_{}", gz));
            data.write(&input, gz).unwrap();
            let reader = CrReader::from_dir(&input).unwrap();
            assert_eq!(reader.n_cells(), 7);
            assert_eq!(reader.n_features(), 5);

            let out = CrToZarr::new(reader, dir.join(format!("out_{}.zarr", gz)))
                .chunk_size(3, 2)
                .write::<B>()
                .unwrap();
            let ds = DataStore::<B>::open(&out, test_config()).unwrap();
            assert_eq!(ds.assay_names(), vec!["ADT", "RNA"]);
            assert_eq!(ds.default_assay_name(), "RNA");
            assert_eq!(ds.cells().ids().unwrap(), cell_ids(7));

            let rna = ds.assay("RNA").unwrap();
            assert_eq!(rna.kind(), AssayKind::Rna);
            assert_eq!(rna.feats().names().unwrap(), vec!["MT-CO1", "RPL3", "ACTB"]);
            assert_eq!(rna.feats().ids().unwrap(), vec!["g1", "g2", "g3"]);
            let rna_counts = data.counts.slice(s![0..3, ..]).t().to_owned();
            assert_eq!(rna.read_counts(&all).unwrap(), rna_counts);
            assert_eq!(
                rna.read_counts(&[6, 0, 4]).unwrap(),
                rna_counts.select(Axis(0), &[6, 0, 4])
            );

            let adt = ds.assay("ADT").unwrap();
            assert_eq!(adt.kind(), AssayKind::Adt);
            assert_eq!(
                adt.read_counts(&all).unwrap(),
                data.counts.slice(s![3..5, ..]).t().to_owned()
            );

            let totals: Vec<u64> = rna_counts
                .outer_iter()
                .map(|r| r.iter().map(|&x| x as u64).sum())
                .collect();
            let n_counts: Vec<i64> = ds.cells().fetch_all("RNA_nCounts").unwrap().into_vec().unwrap();
            assert_eq!(n_counts, totals.iter().map(|&x| x as i64).collect::<Vec<_>>());
            let n_features: Vec<i64> = ds.cells().fetch_all("RNA_nFeatures").unwrap().into_vec().unwrap();
            let expected: Vec<i64> = rna_counts
                .outer_iter()
                .map(|r| r.iter().filter(|&&x| x > 0).count() as i64)
                .collect();
            assert_eq!(n_features, expected);

            let pct = |j: usize| -> Vec<f64> {
                rna_counts
                    .column(j)
                    .iter()
                    .zip(totals.iter())
                    .map(|(&x, &t)| if t == 0 { 0.0 } else { 100.0 * x as f64 / t as f64 })
                    .collect()
            };
            let mito: Vec<f64> = ds.cells().fetch_all("RNA_percentMito").unwrap().into_vec().unwrap();
            assert_close(&mito, &pct(0));
            let ribo: Vec<f64> = ds.cells().fetch_all("RNA_percentRibo").unwrap().into_vec().unwrap();
            assert_close(&ribo, &pct(1));
            assert!(ds.cells().contains("ADT_nCounts"));
            assert!(!ds.cells().contains("ADT_percentMito"));
        }

        let reader = CrReader::from_dir(dir.join("input_false")).unwrap();
        let out = dir.join("out_false.zarr");
        assert!(CrToZarr::new(reader.clone(), &out).write::<B>().is_err());
        CrToZarr::new(reader, &out).overwrite(true).write::<B>().unwrap();
        assert!(CrReader::from_dir(dir.join("missing")).is_err());
    })
}

pub fn test_metadata<B: Backend>() {
    with_tmp_dir(|dir| {
        let store = B::create(dir.join("meta.zarr")).unwrap();
        let ids = cell_ids(5);
        let table = MetaData::<B>::new(store.create_group("table").unwrap(), ids.clone(), ids).unwrap();
        assert_eq!(table.columns(), vec!["I", "ids", "names"]);
        assert!(MetaData::<B>::new(
            store.create_group("dup").unwrap(),
            vec!["a".to_string(), "a".to_string()],
            vec!["x".to_string(), "y".to_string()]
        )
        .is_err());

        table
            .insert("score", vec![1.0f64, 2.0, 3.0, 4.0, 5.0], "I", false)
            .unwrap();
        assert!(table.insert("score", vec![0.0f64; 5], "I", false).is_err());
        assert!(table.insert("ids", vec!["x".to_string(); 5], "I", true).is_err());
        assert!(table.insert("I", vec![true; 5], "I", true).is_err());
        assert!(table.insert("bad", vec![1i64; 3], "I", false).is_err());
        assert!(table.insert("a/b", vec![1i64; 5], "I", false).is_err());

        table.update_key(&[true, false, true, true, false], "I").unwrap();
        assert_eq!(table.active_index("I").unwrap(), vec![0, 2, 3]);
        table.insert("partial", vec![7i64, 8, 9], "I", false).unwrap();
        assert_eq!(table.fetch_all("partial").unwrap(), Column::I64(vec![7, 0, 8, 9, 0]));
        table
            .insert_with_fill(
                "label",
                Column::from(vec!["a".to_string(), "b".to_string(), "c".to_string()]),
                "I",
                false,
                DynScalar::String("none".to_string()),
            )
            .unwrap();
        assert_eq!(
            table.fetch_all("label").unwrap().into_vec::<String>().unwrap(),
            vec!["a", "none", "b", "c", "none"]
        );
        table.insert("flag", vec![true, false, true], "I", false).unwrap();
        assert_eq!(
            table.fetch_all("flag").unwrap(),
            Column::Bool(vec![true, false, false, true, false])
        );
        assert_eq!(table.fetch("score", "I").unwrap(), Column::F64(vec![1.0, 3.0, 4.0]));
        assert_eq!(table.dtype("partial").unwrap(), ScalarType::I64);

        assert_eq!(
            table.sift("score", Some(2.0), Some(4.0)).unwrap(),
            vec![false, true, true, true, false]
        );
        assert_eq!(
            table.sift("score", None, Some(1.0)).unwrap(),
            vec![true, false, false, false, false]
        );
        assert!(table.sift("label", None, None).is_err());

        table.update_key(&[false, true, true, true, true], "subset").unwrap();
        assert_eq!(table.active_index("subset").unwrap(), vec![1, 2, 3, 4]);
        assert!(table.active_index("score").is_err());
        assert!(table.active_index("missing").is_err());
        assert!(table.update_key(&[true], "I").is_err());

        let df = table.to_dataframe(Some(&["score", "label"]), Some("I")).unwrap();
        assert_eq!(df.get_column_names(), vec!["ids", "score", "label"]);
        assert_eq!(df.height(), 3);
        assert_eq!(table.head(2).unwrap().height(), 2);
        assert_eq!(table.to_dataframe(None, None).unwrap().height(), 5);

        let df = DataFrame::new(vec![Series::new("from_df", &[1i32, 2, 3, 4, 5])]).unwrap();
        table.insert_dataframe(&df, "I", false).unwrap();
        assert_eq!(table.fetch_all("from_df").unwrap(), Column::I64(vec![1, 2, 3, 4, 5]));

        table
            .insert("score", vec!["low".to_string(); 5], "I", true)
            .unwrap();
        assert_eq!(table.dtype("score").unwrap(), ScalarType::String);
        assert_eq!(
            table.fetch_all("score").unwrap(),
            Column::String(vec!["low".to_string(); 5])
        );

        table.remove("partial").unwrap();
        assert!(table.remove("ids").is_err());
        assert!(table.remove("partial").is_err());
        let reopened = MetaData::<B>::open(store.open_group("table").unwrap()).unwrap();
        assert_eq!(reopened.columns(), table.columns());
        assert_eq!(reopened.n_rows(), 5);
        reopened.reset_key("I").unwrap();
        assert_eq!(reopened.active_index("I").unwrap().len(), 5);
    })
}

pub fn test_concurrent_insert<B: Backend>() {
    with_tmp_dir(|dir| {
        let store = B::create(dir.join("meta.zarr")).unwrap();
        let ids = cell_ids(10);
        let table = MetaData::<B>::new(store.create_group("t").unwrap(), ids.clone(), ids).unwrap();
        std::thread::scope(|s| {
            for t in 0..8 {
                let table = &table;
                s.spawn(move || {
                    for k in 0..10 {
                        table
                            .insert(&format!("c{}_{}", t, k), vec![k as f64; 10], "I", false)
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(table.columns().len(), 3 + 80);
        let reopened = MetaData::<B>::open(store.open_group("t").unwrap()).unwrap();
        assert_eq!(reopened.columns().len(), 3 + 80);
        assert_eq!(
            reopened.fetch_all("c7_9").unwrap(),
            Column::F64(vec![9.0; 10])
        );
    })
}

fn filter_counts() -> Array2<u32> {
    array![
        [1, 0, 0, 0],
        [2, 2, 0, 0],
        [3, 3, 3, 0],
        [4, 4, 4, 4],
        [0, 0, 0, 0],
        [5, 5, 5, 5]
    ]
}

pub fn test_fetch_dataset<B: Backend>() {
    with_tmp_dir(|dir| {
        let data = TenxData {
            barcodes: cell_ids(6),
            features: tenx_features(),
            counts: rand_counts(5, 6, 10),
        };
        let remote = dir.join("remote");
        data.write(&remote.join("pbmc"), true).unwrap();
        let barcodes = remote.join("pbmc").join("barcodes.tsv.gz");
        std::fs::write(
            remote.join("catalog.tsv"),
            format!(
                "# name\tfile\tsource\n\
                pbmc\tmatrix.mtx.gz\tpbmc/matrix.mtx.gz\n\
                pbmc\tfeatures.tsv.gz\tpbmc/features.tsv.gz\n\
                pbmc\tbarcodes.tsv.gz\tfile://{}\n\
                broken\tmatrix.mtx.gz\tpbmc/missing.mtx.gz\n",
                barcodes.display()
            ),
        )
        .unwrap();
        let catalog = Catalog::from_file(remote.join("catalog.tsv")).unwrap();
        let save = dir.join("datasets");

        let tenx = fetch_dataset::<B, _>(&catalog, "pbmc", &save, DatasetFormat::TenX).unwrap();
        assert_eq!(tenx, save.join("pbmc").join("data"));
        let reader = CrReader::from_dir(&tenx).unwrap();
        assert_eq!(reader.n_cells(), 6);
        assert_eq!(reader.n_features(), 5);

        // Files already fetched are not fetched again.
        std::fs::remove_file(&barcodes).unwrap();
        let zarr = fetch_dataset::<B, _>(&catalog, "pbmc", &save, DatasetFormat::Zarr).unwrap();
        assert_eq!(zarr, save.join("pbmc").join("data.zarr"));
        let ds = DataStore::<B>::open(&zarr, test_config()).unwrap();
        assert_eq!(ds.assay_names(), vec!["ADT", "RNA"]);
        assert_eq!(ds.cells().ids().unwrap(), cell_ids(6));
        assert_eq!(
            fetch_dataset::<B, _>(&catalog, "pbmc", &save, DatasetFormat::Zarr).unwrap(),
            zarr
        );

        assert!(fetch_dataset::<B, _>(&catalog, "unknown", &save, DatasetFormat::TenX).is_err());
        assert!(fetch_dataset::<B, _>(&catalog, "broken", &save, DatasetFormat::TenX).is_err());
        let broken = save.join("broken").join("data");
        assert!(!broken.join("matrix.mtx.gz").exists());
        assert!(!broken.join("matrix.mtx.gz.part").exists());
    })
}

pub fn test_filter<B: Backend>() {
    with_tmp_dir(|dir| {
        let path = dir.join("filter.zarr");
        let rna = AssayData::new("RNA", AssayKind::Rna, &["A", "B", "C", "D"], filter_counts());
        create_store::<B>(&path, &cell_ids(6), &[rna]).unwrap();

        let config = StoreConfig {
            min_features_per_cell: 2,
            ..test_config()
        };
        let ds = DataStore::<B>::open(&path, config).unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap(), vec![1, 2, 3, 5]);
        drop(ds);

        // statistics are computed only once
        let config = StoreConfig {
            min_features_per_cell: 4,
            ..test_config()
        };
        let ds = DataStore::<B>::open(&path, config).unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap(), vec![1, 2, 3, 5]);

        ds.filter_cells(&["RNA_nCounts"], &[Some(5.0)], &[None], false)
            .unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap(), vec![2, 3, 5]);
        ds.filter_cells(&["RNA_nCounts"], &[None], &[Some(16.0)], true)
            .unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(ds.filter_cells(&["RNA_nCounts"], &[None, None], &[None], false).is_err());
        assert!(ds.filter_cells(&["missing"], &[None], &[None], false).is_err());

        ds.cells().reset_key("I").unwrap();
        ds.auto_filter_cells(&["RNA_nCounts"], 0.0, 100.0).unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap().len(), 6);
        ds.auto_filter_cells(&["RNA_nCounts"], 25.0, 75.0).unwrap();
        assert_eq!(ds.cells().active_index("I").unwrap(), vec![1, 2]);
        assert!(ds.auto_filter_cells(&["RNA_nCounts"], 80.0, 20.0).is_err());
    })
}

pub fn test_default_assay<B: Backend>() {
    with_tmp_dir(|dir| {
        let path = dir.join("assays.zarr");
        let adt = AssayData::new("ADT", AssayKind::Adt, &["CD3", "CD4"], rand_counts(6, 2, 5));
        let hto = AssayData::new("HTO", AssayKind::Generic, &["H1"], rand_counts(6, 1, 5));
        create_store::<B>(&path, &cell_ids(6), &[adt, hto]).unwrap();

        // no RNA assay, the first one is used
        let ds = DataStore::<B>::open(&path, test_config()).unwrap();
        assert_eq!(ds.default_assay_name(), "ADT");
        assert_eq!(ds.assay("HTO").unwrap().kind(), AssayKind::Generic);
        assert!(ds.assay("RNA").is_err());
        drop(ds);

        let config = StoreConfig {
            default_assay: Some("HTO".to_string()),
            ..test_config()
        };
        assert_eq!(DataStore::<B>::open(&path, config).unwrap().default_assay_name(), "HTO");
        // persisted
        let ds = DataStore::<B>::open(&path, test_config()).unwrap();
        assert_eq!(ds.default_assay_name(), "HTO");
        assert_eq!(ds.default_assay().unwrap().name(), "HTO");

        let config = StoreConfig {
            default_assay: Some("RNA".to_string()),
            ..test_config()
        };
        assert!(DataStore::<B>::open(&path, config).is_err());
        assert!(DataStore::<B>::open(dir.join("missing.zarr"), test_config()).is_err());
    })
}

pub fn test_normalization<B: Backend>() {
    with_tmp_dir(|dir| {
        let path = dir.join("norm.zarr");
        let counts = array![[0u32, 3, 1], [8, 1, 0], [2, 2, 2], [0, 0, 5]];
        let rna = AssayData::new("RNA", AssayKind::Rna, &["A", "B", "C"], counts.clone());
        let adt = AssayData::new("ADT", AssayKind::Adt, &["X", "Y", "Z"], counts.clone());
        let hto = AssayData::new("HTO", AssayKind::Generic, &["H1", "H2", "H3"], counts.clone());
        create_store::<B>(&path, &cell_ids(4), &[rna, adt, hto]).unwrap();
        let ds = DataStore::<B>::open(&path, test_config()).unwrap();
        ds.cells().update_key(&[true, true, true, false], "I").unwrap();

        let normed = ds.assay("RNA").unwrap().normed(ds.cells(), "I", "I").unwrap();
        assert_eq!(normed.dim(), (3, 3));
        normed
            .sum_axis(Axis(1))
            .iter()
            .for_each(|&x| assert!((x - 1000.0).abs() < 1e-9));

        // CLR factors come from the selected cells only
        let normed = ds.assay("ADT").unwrap().normed(ds.cells(), "I", "I").unwrap();
        let selected = counts.slice(s![0..3, ..]).mapv(|x| x as f64);
        for j in 0..3 {
            let f = (selected.column(j).mapv(|x| x.ln_1p()).sum() / 3.0).exp();
            let expected: Vec<f64> = selected.column(j).iter().map(|x| (x / f).ln_1p()).collect();
            assert_close(&normed.column(j).to_vec(), &expected);
        }

        ds.assay("ADT").unwrap().feats().update_key(&[true, false, true], "I").unwrap();
        let normed = ds.assay("ADT").unwrap().normed(ds.cells(), "I", "I").unwrap();
        assert_eq!(normed.dim(), (3, 2));

        let normed = ds.assay("HTO").unwrap().normed(ds.cells(), "I", "I").unwrap();
        assert_eq!(normed, selected);

        let rna = ds.assay("RNA").unwrap();
        rna.set_summary_stats(ds.cells(), "I").unwrap();
        let n_cells: Vec<i64> = rna.feats().fetch_all("I__nCells").unwrap().into_vec().unwrap();
        assert_eq!(n_cells, vec![2, 3, 2]);
        let normed = rna.normed_rows(&[0, 1, 2], &[0, 1, 2]).unwrap();
        let avg: Vec<f64> = rna.feats().fetch_all("I__avg").unwrap().into_vec().unwrap();
        assert_close(&avg, &normed.mean_axis(Axis(0)).unwrap().to_vec());
        let sigmas: Vec<f64> = rna.feats().fetch_all("I__sigmas").unwrap().into_vec().unwrap();
        assert_close(&sigmas, &normed.std_axis(Axis(0), 0.0).to_vec());

        ds.cells().update_key(&[false; 4], "I").unwrap();
        assert!(rna.set_summary_stats(ds.cells(), "I").is_err());
    })
}

pub fn test_hvgs<B: Backend>() {
    with_tmp_dir(|dir| {
        let path = dir.join("hvgs.zarr");
        let names: Vec<String> = (0..40).map(|i| format!("G{}", i)).collect();
        let names: Vec<&str> = names.iter().map(|x| x.as_str()).collect();
        let mut counts = rand_counts(60, 40, 20);
        counts.column_mut(39).fill(0);
        let rna = AssayData::new("RNA", AssayKind::Rna, &names, counts);
        create_store::<B>(&path, &cell_ids(60), &[rna]).unwrap();
        let ds = DataStore::<B>::open(&path, test_config()).unwrap();

        let config = HvgConfig {
            top_n: 5,
            min_cells: 1,
            n_bins: 4,
            ..HvgConfig::default()
        };
        assert_eq!(ds.mark_hvgs("RNA", "I", &config).unwrap(), 5);
        let rna = ds.assay("RNA").unwrap();
        assert!(rna.feats().contains("I__avg"));
        let hvgs: Vec<bool> = rna.feats().fetch_all("I__hvgs").unwrap().into_vec().unwrap();
        assert_eq!(hvgs.iter().filter(|x| **x).count(), 5);
        assert!(!hvgs[39]);

        let mut active = vec![true; 40];
        active[..10].iter_mut().for_each(|x| *x = false);
        rna.feats().update_key(&active, "I").unwrap();
        assert_eq!(ds.mark_hvgs("RNA", "I", &config).unwrap(), 5);
        let hvgs: Vec<bool> = rna.feats().fetch_all("I__hvgs").unwrap().into_vec().unwrap();
        assert!(hvgs[..10].iter().all(|x| !*x));

        let config = HvgConfig {
            min_cells: 1000,
            ..config
        };
        assert_eq!(ds.mark_hvgs("RNA", "I", &config).unwrap(), 0);
        assert!(ds.mark_hvgs("ATAC", "I", &config).is_err());
    })
}

pub fn test_cell_cycle<B: Backend>() {
    with_tmp_dir(|dir| {
        let path = dir.join("cycle.zarr");
        let counts = array![
            [10u32, 10, 0, 0, 1, 1],
            [0, 0, 10, 10, 1, 1],
            [0, 0, 0, 0, 10, 10]
        ];
        let rna = AssayData::new(
            "RNA",
            AssayKind::Rna,
            &["MCM5", "PCNA", "HMGB2", "CDK1", "ACTB", "GAPDH"],
            counts,
        );
        create_store::<B>(&path, &cell_ids(3), &[rna]).unwrap();
        let ds = DataStore::<B>::open(&path, test_config()).unwrap();

        ds.score_cell_cycle("RNA", "I", None, None).unwrap();
        let phase: Vec<String> = ds.cells().fetch_all("I__phase").unwrap().into_vec().unwrap();
        assert_eq!(phase, vec!["S", "G2M", "G1"]);
        let s: Vec<f64> = ds.cells().fetch_all("I__S_score").unwrap().into_vec().unwrap();
        assert!((s[0] - (1000.0 * 10.0 / 22.0 - 1000.0 / 6.0)).abs() < 1e-9);

        ds.cells().update_key(&[true, true, false], "sub").unwrap();
        ds.score_cell_cycle("RNA", "sub", None, None).unwrap();
        let phase: Vec<String> = ds.cells().fetch_all("sub__phase").unwrap().into_vec().unwrap();
        assert_eq!(phase, vec!["S", "G2M", "NA"]);

        assert!(ds
            .score_cell_cycle("RNA", "I", Some(&["NOPE"][..]), None)
            .is_err());
    })
}

pub fn test_merge<B: Backend>() {
    with_tmp_dir(|dir| {
        let a_counts = array![[1u32, 2, 3], [4, 5, 6], [7, 8, 9]];
        let b_counts = array![[10u32, 11, 12], [13, 14, 15]];
        create_store::<B>(
            &dir.join("a.zarr"),
            &cell_ids(3),
            &[AssayData::new("RNA", AssayKind::Rna, &["A", "B", "C"], a_counts.clone())],
        )
        .unwrap();
        create_store::<B>(
            &dir.join("b.zarr"),
            &cell_ids(2),
            &[AssayData::new("RNA", AssayKind::Rna, &["B", "C", "D"], b_counts.clone())],
        )
        .unwrap();
        let ds_a = DataStore::<B>::open(dir.join("a.zarr"), test_config()).unwrap();
        let ds_b = DataStore::<B>::open(dir.join("b.zarr"), test_config()).unwrap();
        ds_a.cells().insert("score", vec![0.5f64, 1.5, 2.5], "I", false).unwrap();
        ds_a.cells().update_key(&[true, false, true], "I").unwrap();
        ds_a.assay("RNA")
            .unwrap()
            .set_summary_stats(ds_a.cells(), "I")
            .unwrap();

        let inputs = [(&ds_a, "RNA"), (&ds_b, "RNA")];
        let out = dir.join("merged.zarr");
        merge(&inputs, &["s1", "s2"], &out, "RNA", &MergeConfig::default()).unwrap();

        let merged = DataStore::<B>::open(&out, test_config()).unwrap();
        assert_eq!(
            merged.cells().ids().unwrap(),
            vec!["s1__cell0", "s1__cell1", "s1__cell2", "s2__cell0", "s2__cell1"]
        );
        let rna = merged.assay("RNA").unwrap();
        assert_eq!(rna.feats().ids().unwrap(), vec!["id-A", "id-B", "id-C", "id-D"]);
        assert_eq!(rna.feats().names().unwrap(), vec!["A", "B", "C", "D"]);
        assert_eq!(rna.feats().columns(), vec!["I", "ids", "names"]);
        let expected = array![
            [1u32, 2, 3, 0],
            [4, 5, 6, 0],
            [7, 8, 9, 0],
            [0, 10, 11, 12],
            [0, 13, 14, 15]
        ];
        assert_eq!(rna.read_counts(&[0, 1, 2, 3, 4]).unwrap(), expected);

        assert_eq!(merged.cells().active_index("I").unwrap().len(), 5);
        let orig_i: Vec<bool> = merged.cells().fetch_all("orig_I").unwrap().into_vec().unwrap();
        assert_eq!(orig_i, vec![true, false, true, true, true]);
        let score: Vec<f64> = merged.cells().fetch_all("orig_score").unwrap().into_vec().unwrap();
        assert_eq!(&score[..3], &[0.5, 1.5, 2.5]);
        assert!(score[3].is_nan() && score[4].is_nan());
        let labels: Vec<String> = merged.cells().fetch_all("sample_id").unwrap().into_vec().unwrap();
        assert_eq!(labels, vec!["s1", "s1", "s1", "s2", "s2"]);
        assert!(merged.cells().contains("orig_RNA_nCounts"));

        // inclusion flags are re-imported by hand
        merged.cells().update_key(&orig_i, "I").unwrap();
        assert_eq!(merged.cells().active_index("I").unwrap(), vec![0, 2, 3, 4]);
        drop(merged);

        // adding a second assay over the same cells
        merge(&inputs, &["s1", "s2"], &out, "RNA2", &MergeConfig::default()).unwrap();
        let merged = DataStore::<B>::open(&out, test_config()).unwrap();
        assert_eq!(merged.assay_names(), vec!["RNA", "RNA2"]);
        drop(merged);
        assert!(merge(&inputs, &["s1", "s2"], &out, "RNA", &MergeConfig::default()).is_err());
        assert!(merge(&inputs, &["x", "y"], &out, "RNA3", &MergeConfig::default()).is_err());

        let config = MergeConfig {
            overwrite: true,
            join: JoinType::Inner,
            reset_cell_filter: false,
            ..MergeConfig::default()
        };
        merge(&inputs, &["x", "y"], &out, "RNA", &config).unwrap();
        let merged = DataStore::<B>::open(&out, test_config()).unwrap();
        assert_eq!(merged.assay_names(), vec!["RNA"]);
        let rna = merged.assay("RNA").unwrap();
        assert_eq!(rna.feats().ids().unwrap(), vec!["id-B", "id-C"]);
        assert_eq!(
            rna.read_counts(&[0, 3]).unwrap(),
            array![[2u32, 3], [10, 11]]
        );
        assert_eq!(merged.cells().active_index("I").unwrap(), vec![0, 2, 3, 4]);

        assert!(merge(&inputs, &["s1"], dir.join("m2.zarr"), "RNA", &MergeConfig::default()).is_err());
        assert!(merge(&inputs, &["s1", "s1"], dir.join("m2.zarr"), "RNA", &MergeConfig::default()).is_err());
        assert!(merge(&inputs, &["s__1", "s2"], dir.join("m2.zarr"), "RNA", &MergeConfig::default()).is_err());
        assert!(merge(&inputs, &["s1", "s2"], dir.join("m2.zarr"), "ADT", &MergeConfig::default()).is_err());
    })
}

pub fn test_merge_columns<B: Backend>() {
    with_tmp_dir(|dir| {
        create_store::<B>(
            &dir.join("a.zarr"),
            &cell_ids(3),
            &[AssayData::new("RNA", AssayKind::Rna, &["A", "B"], array![[1u32, 2], [3, 4], [5, 6]])],
        )
        .unwrap();
        create_store::<B>(
            &dir.join("b.zarr"),
            &cell_ids(2),
            &[AssayData::new("ADT", AssayKind::Adt, &["B", "C"], array![[7u32, 8], [9, 10]])],
        )
        .unwrap();
        let ds_a = DataStore::<B>::open(dir.join("a.zarr"), test_config()).unwrap();
        let ds_b = DataStore::<B>::open(dir.join("b.zarr"), test_config()).unwrap();
        ds_a.cells().insert("num", vec![1i64, 2, 3], "I", false).unwrap();
        ds_b.cells().insert("num", vec![0.5f64, 1.5], "I", false).unwrap();
        ds_a.cells().insert("mixed", vec!["x".to_string(); 3], "I", false).unwrap();
        ds_b.cells().insert("mixed", vec![1i64, 2], "I", false).unwrap();
        ds_a.cells().insert("flag", vec![true, true, true], "I", false).unwrap();
        ds_b.cells().insert("tag", vec!["p".to_string(), "q".to_string()], "I", false).unwrap();

        let out = dir.join("merged.zarr");
        let inputs = [(&ds_a, "RNA"), (&ds_b, "ADT")];
        merge(&inputs, &["a", "b"], &out, "RNA", &MergeConfig::default()).unwrap();
        let merged = DataStore::<B>::open(&out, test_config()).unwrap();

        // the first input decides the kind
        assert_eq!(merged.assay("RNA").unwrap().kind(), AssayKind::Rna);
        assert_eq!(
            merged.assay("RNA").unwrap().feats().ids().unwrap(),
            vec!["id-A", "id-B", "id-C"]
        );

        let cells = merged.cells();
        assert_eq!(cells.dtype("orig_num").unwrap(), ScalarType::F64);
        assert_eq!(
            cells.fetch_all("orig_num").unwrap(),
            Column::F64(vec![1.0, 2.0, 3.0, 0.5, 1.5])
        );
        assert!(!cells.contains("orig_mixed"));
        assert_eq!(
            cells.fetch_all("orig_flag").unwrap(),
            Column::Bool(vec![true, true, true, false, false])
        );
        assert_eq!(
            cells.fetch_all("orig_tag").unwrap().into_vec::<String>().unwrap(),
            vec!["NA", "NA", "NA", "p", "q"]
        );
    })
}

pub fn test_array_io<B: Backend>() {
    with_tmp_dir(|dir| {
        let store = B::create(dir.join("arrays.zarr")).unwrap();
        let cases = (1usize..20, 1usize..10, 1usize..6, 1usize..6).prop_flat_map(|(n, m, r, c)| {
            (
                counts_strat(n, m),
                range_strat(n),
                range_strat(m),
                Just(Shape::from((r, c))),
            )
        });
        proptest!(ProptestConfig::with_cases(64), |((arr, rows, cols, chunks) in cases)| {
            if store.exists("x").unwrap() {
                store.delete("x").unwrap();
            }
            let config = WriteConfig { compression: Some(1), block_size: Some(chunks) };
            let shape = Shape::from(arr.shape());
            let dataset = store.new_dataset::<u32>("x", &shape, config).unwrap();
            dataset.write_array(arr.view().into_dyn()).unwrap();
            let part = dataset.read_array_slice::<u32>(&[rows.clone(), cols.clone()]).unwrap();
            prop_assert_eq!(part, arr.slice(s![rows, cols]).to_owned().into_dyn());
        });
    })
}

pub fn test_column_io<B: Backend>() {
    with_tmp_dir(|dir| {
        let store = B::create(dir.join("columns.zarr")).unwrap();
        let cases = (1usize..30).prop_flat_map(|n| (column_strat(n), mask_strat(n)));
        proptest!(ProptestConfig::with_cases(64), |((column, mask) in cases)| {
            if store.exists("table").unwrap() {
                store.delete("table").unwrap();
            }
            let ids = cell_ids(column.len());
            let table = MetaData::<B>::new(store.create_group("table").unwrap(), ids.clone(), ids).unwrap();
            table.insert("x", column.clone(), "I", false).unwrap();
            prop_assert!(column_eq(&table.fetch_all("x").unwrap(), &column));

            table.update_key(&mask, "I").unwrap();
            let index = table.active_index("I").unwrap();
            let subset = column.take(&index);
            prop_assert!(column_eq(&table.fetch("x", "I").unwrap(), &subset));
            table.insert("y", subset.clone(), "I", false).unwrap();
            prop_assert!(column_eq(&table.fetch("y", "I").unwrap(), &subset));
        });
    })
}
