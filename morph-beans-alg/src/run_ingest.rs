use clap::Parser;
use log::info;
use morph_beans::batch_ingest::ingest_directory;
use morph_beans::columnar::IngestOptions;

#[derive(Parser, Debug, Clone)]
pub struct IngestArgs {
    #[arg(
        required = true,
        help = "Directories (or files) to search",
        long_help = "Directories (or files) to search recursively. \n\
		     Every file whose name ends with the suffix is ingested."
    )]
    roots: Vec<Box<str>>,

    #[arg(
        short,
        long,
        default_value = "Nuclei.csv",
        help = "File name suffix to match"
    )]
    suffix: Box<str>,

    #[arg(
        long = "n-headers",
        default_value_t = 1,
        help = "Number of header rows",
        long_help = "Number of header rows. \n\
		     Multiple header rows are merged into one name per column."
    )]
    n_headers: usize,

    #[arg(short, long, default_value_t = ',', help = "Field delimiter")]
    delimiter: char,

    #[arg(
        long = "feature-delim",
        default_value = "_",
        help = "Delimiter splitting feature names into annotation parts"
    )]
    feature_delim: Box<str>,

    #[arg(
        long = "meta-cols",
        value_delimiter = ',',
        help = "Metadata columns (comma-separated)",
        long_help = "Metadata columns (comma-separated). \n\
		     Replaces the built-in rules recognizing metadata columns."
    )]
    meta_cols: Option<Vec<Box<str>>>,

    #[arg(short, long, required = true, help = "Output `.h5` file")]
    output: Box<str>,

    #[arg(
        short,
        long = "verbose",
        help = "Verbosity.",
        long_help = "Increase output verbosity."
    )]
    verbose: bool,
}

pub fn run_ingest(args: IngestArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    anyhow::ensure!(
        args.delimiter.is_ascii(),
        "delimiter must be a single ascii character"
    );

    let opts = IngestOptions {
        n_headers: args.n_headers,
        delimiter: args.delimiter as u8,
        feature_delim: args.feature_delim.clone(),
        meta_cols: args.meta_cols.clone(),
        progress: args.verbose,
        ..Default::default()
    };

    let roots: Vec<&str> = args.roots.iter().map(|x| x.as_ref()).collect();
    let matrix = ingest_directory(&roots, &args.suffix, &opts, &args.output)?;
    info!("{} observations x {} features", matrix.n_obs(), matrix.n_vars());
    matrix.close()?;

    info!("Done");
    Ok(())
}
