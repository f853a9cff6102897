use approx::assert_abs_diff_eq;
use morph_beans::annotated::*;
use morph_beans::batch_ingest::*;
use morph_beans::column_rules::*;
use morph_beans::columnar::*;
use morph_beans::errors::MorphError;
use morph_beans::header::parse_header;
use morph_beans::meta_table::{MetaColumn, MetaTable};

use ndarray::{array, Array2};
use std::io::Write;
use std::path::{Path, PathBuf};

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(content.as_bytes())?;
    Ok(())
}

fn as_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str().ok_or(anyhow::anyhow!("non-utf8 path"))
}

#[test]
fn classifier_is_a_partition() {
    let columns = [
        "ImageNumber",
        "ObjectNumber",
        "Metadata_Well",
        "Metadata_Location",
        "FileName_DNA",
        "Nuclei_AreaShape_Area",
        "Nuclei_AreaShape_Orientation",
        "Nuclei_Location_Center_X",
        "Nuclei_AreaShape_BoundingBoxMaximum_Y",
        "Nuclei_Intensity_MeanIntensity_DNA",
        "Nuclei_Intensity_MeanIntensity_DNA",
        "Cells_Neighbors_NumberOfNeighbors_5",
        "Parent_Cells",
    ];
    let c = classify(&columns);

    let mut all: Vec<&str> = c
        .metadata
        .iter()
        .chain(c.discarded.iter())
        .chain(c.measurement.iter())
        .map(|x| x.as_ref())
        .collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total, "classes overlap");

    let mut unique: Vec<&str> = columns.to_vec();
    unique.sort();
    unique.dedup();
    assert_eq!(all, unique);

    assert!(c.metadata.iter().any(|x| x.as_ref() == "Metadata_Location"));
    assert_eq!(
        c.measurement,
        vec![
            Box::from("Nuclei_AreaShape_Area"),
            Box::from("Nuclei_Intensity_MeanIntensity_DNA")
        ]
    );
    assert_eq!(c.discarded.len(), 4);
}

#[test]
fn multi_row_header_is_merged_and_sanitized() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("two_headers.csv");
    write_file(
        &file,
        "Nuclei,Nuclei,Image\nArea,Area.1,Metadata_Well\n1,2,A01\n",
    )?;

    let header = parse_header(as_str(&file)?, 2, b',', true)?;
    assert_eq!(
        header,
        vec![
            Box::from("Nuclei_Area"),
            Box::from("Nuclei_Area"),
            Box::from("Image_Metadata_Well")
        ]
    );

    let raw = parse_header(as_str(&file)?, 2, b',', false)?;
    assert_eq!(raw[1].as_ref(), "Nuclei_Area.1");
    Ok(())
}

fn write_three_plates(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    for (p, wells) in [("W1", "W2"), ("W3", "W4"), ("W5", "W6")].iter().enumerate() {
        let file = root.join(format!("plate{}", p + 1)).join("Nuclei.csv");
        let base = (p * 10) as f32;
        write_file(
            &file,
            &format!(
                "A,B,Metadata_Well,C_1_2\n{},{},{},{}\n{},{},{},{}\n",
                base + 1.0,
                base + 2.0,
                wells.0,
                base + 3.0,
                base + 4.0,
                base + 5.0,
                wells.1,
                base + 6.0
            ),
        )?;
        files.push(file);
    }
    // not matching the pattern
    write_file(&root.join("plate1").join("Image.csv"), "X\n1\n")?;
    Ok(files)
}

#[test]
fn three_files_stream_into_one_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_three_plates(dir.path())?;
    let output = dir.path().join("out.h5");

    let found = find_files(&[dir.path()], "Nuclei.csv")?;
    assert_eq!(found, files);

    let adata = ingest_directory(&[dir.path()], "Nuclei.csv", &IngestOptions::default(), as_str(&output)?)?;

    assert_eq!(adata.shape(), (6, 3));
    assert!(adata.x().is_backed());
    assert_eq!(
        adata.var_names(),
        &[Box::<str>::from("A"), "B".into(), "C_1_2".into()]
    );
    assert_eq!(adata.var().arity(), 3);
    assert_eq!(adata.var().part(2, 2), Some("2"));
    assert_eq!(adata.var().part(0, 1), None);

    let wells = adata
        .obs()
        .column("Metadata_Well")
        .map(|c| c.to_text())
        .ok_or(anyhow::anyhow!("no well column"))?;
    let expected: Vec<Box<str>> = ["W1", "W2", "W3", "W4", "W5", "W6"]
        .iter()
        .map(|&x| Box::from(x))
        .collect();
    assert_eq!(wells, expected);

    let x = adata.x().to_dense()?;
    assert_abs_diff_eq!(x[(0, 0)], 1.0);
    assert_abs_diff_eq!(x[(3, 2)], 16.0);
    assert_abs_diff_eq!(x[(5, 1)], 25.0);
    adata.close()?;

    let back = AnnotatedMatrix::read_hdf5(as_str(&output)?, true)?;
    assert_eq!(back.shape(), (6, 3));
    assert_eq!(back.obs().column("Metadata_Well").map(|c| c.to_text()), Some(expected));
    assert_eq!(back.var().part(2, 0), Some("C"));
    assert_eq!(back.x().read_rows_indexed(&[3])?, x.slice(ndarray::s![3..4, ..]));
    Ok(())
}

/// Refuses any block larger than one file
struct BoundedSink {
    shape: (usize, usize),
    max_rows: usize,
    writes: Vec<(usize, usize)>,
}

impl BlockSink for BoundedSink {
    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn write_block(&mut self, row_offset: usize, block: &Array2<f32>) -> anyhow::Result<()> {
        anyhow::ensure!(
            block.nrows() <= self.max_rows,
            "asked to hold {} rows at once",
            block.nrows()
        );
        self.writes.push((row_offset, block.nrows()));
        Ok(())
    }
}

#[test]
fn streaming_holds_one_file_at_a_time() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_three_plates(dir.path())?;
    let opts = IngestOptions::default();

    let header = parse_header(as_str(&files[0])?, 1, b',', true)?;
    let plan = opts.plan(header);
    let (obs, rows_per_file) = read_batch_metadata(&files, &plan, &opts)?;
    assert_eq!(obs.nrows(), 6);
    assert_eq!(rows_per_file, vec![2, 2, 2]);

    let mut sink = BoundedSink {
        shape: (6, 3),
        max_rows: 2,
        writes: vec![],
    };
    let nwritten = stream_measurements(&files, &rows_per_file, &plan, &opts, &mut sink)?;
    assert_eq!(nwritten, 6);
    assert_eq!(sink.writes, vec![(0, 2), (2, 2), (4, 2)]);

    // a store sized for fewer rows fails loudly
    let mut small = BoundedSink {
        shape: (5, 3),
        max_rows: 2,
        writes: vec![],
    };
    let err = stream_measurements(&files, &rows_per_file, &plan, &opts, &mut small)
        .err()
        .ok_or(anyhow::anyhow!("expected a failure"))?;
    assert!(matches!(
        err.downcast_ref::<MorphError>(),
        Some(MorphError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn no_matching_files_is_input_not_found() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_file(&dir.path().join("Image.csv"), "X\n1\n")?;

    let err = find_files(&[dir.path()], "Nuclei.csv")
        .err()
        .ok_or(anyhow::anyhow!("expected a failure"))?;
    assert!(matches!(
        err.downcast_ref::<MorphError>(),
        Some(MorphError::InputNotFound(_))
    ));

    let missing = dir.path().join("nowhere");
    assert!(find_files(&[missing], "Nuclei.csv").is_err());
    Ok(())
}

#[test]
fn assemble_rejects_row_mismatch() -> anyhow::Result<()> {
    let mut meta = MetaTable::empty(3);
    meta.insert(
        "Metadata_Well",
        MetaColumn::Text(vec!["A".into(), "B".into(), "C".into()]),
    )?;
    let x: Array2<f32> = Array2::zeros((2, 2));

    let err = assemble(meta, x, vec!["f_1".into(), "f_2".into()], "_")
        .err()
        .ok_or(anyhow::anyhow!("expected a failure"))?;
    assert!(matches!(
        err.downcast_ref::<MorphError>(),
        Some(MorphError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn assembled_matrix_keeps_inputs() -> anyhow::Result<()> {
    let mut meta = MetaTable::empty(2);
    meta.insert("Metadata_Well", MetaColumn::Text(vec!["A".into(), "B".into()]))?;
    meta.insert("Metadata_Site", MetaColumn::Numeric(vec![1.0, 2.0]))?;
    let x = array![[1.0_f32, 2.0], [3.0, 4.0]];

    let adata = assemble(meta.clone(), x.clone(), vec!["f_1".into(), "g".into()], "_")?;
    assert_eq!(adata.obs(), &meta);
    assert_eq!(adata.x().to_dense()?, x);
    assert_eq!(adata.obs_names(), &[Box::<str>::from("0"), "1".into()]);
    Ok(())
}

#[test]
fn malformed_and_missing_cells() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let good = dir.path().join("good.csv");
    write_file(&good, "Metadata_Well,Area,Perimeter\nA01,1.5,\nA02,,3\n")?;

    let adata = read_cellprofiler(as_str(&good)?, &IngestOptions::default())?;
    let x = adata.x().to_dense()?;
    assert!(x[(0, 1)].is_nan());
    assert!(x[(1, 0)].is_nan());
    assert_abs_diff_eq!(x[(1, 1)], 3.0);

    let bad = dir.path().join("bad.csv");
    write_file(&bad, "Metadata_Well,Area,Perimeter\nA01,1.5,2\nA02,big,3\n")?;
    let err = read_cellprofiler(as_str(&bad)?, &IngestOptions::default())
        .err()
        .ok_or(anyhow::anyhow!("expected a failure"))?;
    match err.downcast_ref::<MorphError>() {
        Some(MorphError::MalformedValue {
            row, column, value, ..
        }) => {
            assert_eq!(*row, 3);
            assert_eq!(column, "Area");
            assert_eq!(value, "big");
        }
        other => anyhow::bail!("unexpected error {:?}", other),
    }
    Ok(())
}

#[test]
fn gzipped_csv_is_read() -> anyhow::Result<()> {
    use flate2::write::GzEncoder;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("Nuclei.csv.gz");
    let mut enc = GzEncoder::new(std::fs::File::create(&file)?, flate2::Compression::default());
    enc.write_all(b"ImageNumber,Nuclei_Area,Nuclei_Location_Center_X\n1,10,5\n1,20,6\n")?;
    enc.finish()?;

    let adata = morph_beans::read::read(as_str(&file)?, &IngestOptions::default())?;
    assert_eq!(adata.shape(), (2, 1));
    assert_eq!(adata.var_names(), &[Box::<str>::from("Nuclei_Area")]);
    assert!(adata.obs().column("ImageNumber").is_some_and(|c| c.is_numeric()));
    Ok(())
}

#[test]
fn unsupported_extension_lists_choices() {
    let err = morph_beans::read::read("cells.parquet", &IngestOptions::default());
    let msg = err.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(msg.contains("parquet"));
    assert!(msg.contains("sqlite"));
}

#[test]
fn image_qc_labels_move_to_obs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("image_qc.csv");
    write_file(
        &file,
        "Image_Metadata_Well,ImageQuality_PowerLogLogSlope_DNA,Image_Metadata_QClabel\nA01,-1.5,1\nA02,-2.0,\n",
    )?;

    let qc = read_image_qc(as_str(&file)?, "Image_Metadata_QClabel", &IngestOptions::default())?;
    assert_eq!(qc.shape(), (2, 1));
    let label = qc.obs().column("label").ok_or(anyhow::anyhow!("no label"))?;
    assert_eq!(label.text_at(0).as_ref(), "1");
    assert_eq!(label.text_at(1).as_ref(), "");
    Ok(())
}
