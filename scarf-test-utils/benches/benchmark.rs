use criterion::{criterion_group, criterion_main, Criterion};
use scarf::*;
use scarf_test_utils::*;
use scarf_zarr::Zarr;
use std::hint::black_box;

fn bench_convert(c: &mut Criterion) {
    with_tmp_dir(|dir| {
        let data = TenxData {
            barcodes: cell_ids(2000),
            features: (0..500)
                .map(|i| (format!("g{}", i), format!("G{}", i), "Gene Expression".to_string()))
                .collect(),
            counts: rand_counts(500, 2000, 20),
        };
        let input = dir.join("input");
        data.write(&input, true).unwrap();
        let out = dir.join("out.zarr");
        c.bench_function("Convert 2000 cells x 500 features (Zarr)", |b| {
            b.iter(|| {
                let reader = CrReader::from_dir(black_box(&input)).unwrap();
                CrToZarr::new(reader, &out).overwrite(true).write::<Zarr>().unwrap()
            })
        });
    })
}

fn bench_assay(c: &mut Criterion) {
    with_tmp_dir(|dir| {
        let path = dir.join("bench.zarr");
        let names: Vec<String> = (0..500).map(|i| format!("G{}", i)).collect();
        let names: Vec<&str> = names.iter().map(|x| x.as_str()).collect();
        let rna = AssayData::new("RNA", AssayKind::Rna, &names, rand_counts(5000, 500, 20));
        create_store::<Zarr>(&path, &cell_ids(5000), &[rna]).unwrap();
        let config = StoreConfig {
            nthreads: 4,
            chunk_rows: 500,
            ..StoreConfig::default()
        };
        let ds = DataStore::<Zarr>::open(&path, config).unwrap();
        let rows: Vec<usize> = (0..5000).step_by(3).collect();
        let rna = ds.assay("RNA").unwrap();

        c.bench_function("Read counts of 1667 cells (Zarr)", |b| {
            b.iter(|| rna.read_counts(black_box(&rows)).unwrap())
        });
        c.bench_function("Summary statistics of 5000 cells (Zarr)", |b| {
            b.iter(|| rna.set_summary_stats(ds.cells(), "I").unwrap())
        });
        c.bench_function("Mark HVGs (Zarr)", |b| {
            b.iter(|| ds.mark_hvgs("RNA", "I", &HvgConfig::default()).unwrap())
        });
    })
}

criterion_group!(benches, bench_convert, bench_assay);
criterion_main!(benches);
