use approx::assert_abs_diff_eq;
use morph_beans::sql_io::read_sql;
use rusqlite::Connection;

fn write_export(file: &str) -> anyhow::Result<()> {
    let conn = Connection::open(file)?;
    conn.execute_batch(
        r#"
        CREATE TABLE Image (TableNumber INTEGER, ImageNumber INTEGER, Metadata_Well TEXT, Count_Cells INTEGER, Image_Width REAL);
        INSERT INTO Image VALUES (1, 1, 'A01', 2, 512.0), (2, 2, 'A02', 1, 512.0);

        CREATE TABLE Nuclei (TableNumber INTEGER, ImageNumber INTEGER, ObjectNumber INTEGER, Nuclei_AreaShape_Area REAL, Nuclei_Location_Center_X REAL);
        INSERT INTO Nuclei VALUES (1, 1, 1, 10.0, 3.0), (1, 1, 2, 12.0, 4.0), (2, 2, 1, NULL, 5.0);

        CREATE TABLE Cells (TableNumber INTEGER, ImageNumber INTEGER, ObjectNumber INTEGER, Cells_AreaShape_Area REAL);
        INSERT INTO Cells VALUES (1, 1, 1, 30.0), (1, 1, 2, 31.0), (2, 2, 1, 32.0);

        CREATE TABLE Experiment (Name TEXT);
        "#,
    )?;
    Ok(())
}

#[test]
fn sql_export_joins_objects_and_images() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("export.sqlite");
    let file = file.to_str().ok_or(anyhow::anyhow!("non-utf8 path"))?;
    write_export(file)?;

    let adata = read_sql(file, "_")?;
    assert_eq!(adata.shape(), (3, 2));
    assert_eq!(
        adata.var_names().to_vec(),
        vec![
            Box::<str>::from("Nuclei_AreaShape_Area"),
            Box::<str>::from("Cells_AreaShape_Area")
        ]
    );

    let x = adata.x().to_dense()?;
    assert!(x[(2, 0)].is_nan());
    assert_abs_diff_eq!(x[(1, 1)], 31.0);

    let wells = adata
        .obs()
        .column("Metadata_Well")
        .map(|c| c.to_text())
        .ok_or(anyhow::anyhow!("image metadata not joined"))?;
    assert_eq!(wells, vec![Box::<str>::from("A01"), "A01".into(), "A02".into()]);
    assert!(adata.obs().column("Count_Cells").is_some());
    assert!(adata.obs().column("Image_Width").is_none());
    Ok(())
}
