use clap::Parser;
use log::info;
use morph_beans::columnar::IngestOptions;
use morph_beans::read::read;
use morph_beans_alg::distance::aggregate;
use morph_beans_alg::grouped_op::Statistic;

#[derive(Parser, Debug, Clone)]
pub struct AggregateArgs {
    #[arg(
        required = true,
        help = "Input file (`.csv`, `.h5`, `.h5ad`, `.sql` or `.sqlite`)"
    )]
    input: Box<str>,

    #[arg(
        short,
        long = "well-key",
        help = "Well column",
        long_help = "Observation metadata column identifying wells. \n\
		     Inferred from the column names if not given."
    )]
    well_key: Option<Box<str>>,

    #[arg(
        short,
        long = "group-keys",
        value_delimiter = ',',
        help = "Additional grouping columns (comma-separated)"
    )]
    group_keys: Vec<Box<str>>,

    #[arg(
        short,
        long,
        default_value = "median",
        help = "Summary statistic",
        long_help = "Summary statistic: \n\
		     mean, logmean, median, std, var, sem, mad or mad_scaled."
    )]
    method: Statistic,

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

pub fn run_aggregate(args: AggregateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let opts = IngestOptions {
        progress: args.verbose,
        ..Default::default()
    };
    let mut matrix = read(&args.input, &opts)?;
    info!(
        "read {} observations x {} features",
        matrix.n_obs(),
        matrix.n_vars()
    );

    let wells = aggregate(
        &mut matrix,
        args.well_key.as_deref(),
        &args.group_keys,
        args.method,
        args.verbose,
    )?;
    info!("{} aggregated profiles", wells.n_obs());

    wells.write_hdf5(&args.output)?;
    info!("Done");
    Ok(())
}
