use camino::Utf8PathBuf;
use clap::Parser;
use tsumiki::{CONFIG_FILE, Config, Mode, Pipeline};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Which pipeline to run.
    #[clap(value_enum, index = 1, default_value = "dev")]
    mode: Mode,

    /// Build once and exit instead of watching for changes.
    #[clap(long)]
    no_watch: bool,

    /// Path to the configuration file.
    #[clap(long, default_value = CONFIG_FILE)]
    config: Utf8PathBuf,

    /// Print the stage plan as a Mermaid diagram and exit.
    #[clap(long)]
    graph: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tsumiki::init_logging()?;

    let config = Config::load(&args.config)?;
    let watch = !args.no_watch && matches!(args.mode, Mode::Dev | Mode::Full);
    let pipeline = Pipeline::new(config, args.mode, watch && !args.graph)?;

    if args.graph {
        let plan = pipeline.graph().plan(args.mode)?;
        println!("{}", pipeline.graph().render_plan(plan));
        return Ok(());
    }

    pipeline.run()?;

    Ok(())
}
