use scarf_test_utils::*;
use scarf_zarr::Zarr;

#[test]
fn test_convert_zarr() {
    test_convert::<Zarr>()
}

#[test]
fn test_metadata_zarr() {
    test_metadata::<Zarr>()
}

#[test]
fn test_filter_zarr() {
    test_filter::<Zarr>()
}

#[test]
fn test_default_assay_zarr() {
    test_default_assay::<Zarr>()
}

#[test]
fn test_normalization_zarr() {
    test_normalization::<Zarr>()
}

#[test]
fn test_hvgs_zarr() {
    test_hvgs::<Zarr>()
}

#[test]
fn test_cell_cycle_zarr() {
    test_cell_cycle::<Zarr>()
}

#[test]
fn test_merge_zarr() {
    test_merge::<Zarr>()
}

#[test]
fn test_array_io_zarr() {
    test_array_io::<Zarr>()
}

#[test]
fn test_column_io_zarr() {
    test_column_io::<Zarr>()
}

#[test]
fn test_concurrent_insert_zarr() {
    test_concurrent_insert::<Zarr>()
}

#[test]
fn test_merge_columns_zarr() {
    test_merge_columns::<Zarr>()
}

#[test]
fn test_fetch_dataset_zarr() {
    test_fetch_dataset::<Zarr>()
}
