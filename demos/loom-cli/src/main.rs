use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use loomcore::{
    storage::StoredProgram,
    tests_utils,
    utils::{conf::WeaverConfig, error::WeaveResult},
    weaver::Weaver,
    wvlog::{LogChannel, LogLevel},
};

#[derive(ClapParser)]
#[command(about = "Weave interceptor hooks into stored program units")]
pub struct Arguments {
    /// Print debug and trace messages of the weaver
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one weaving pass over a stored program
    Weave {
        /// Path to the stored program
        input: PathBuf,
        /// Where to write the woven program (defaults to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Weaver configuration (TOML); `LOOM_CONFIG_PATH` or `loom.toml` otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the listing of a stored program
    Dump {
        input: PathBuf,
        /// Only print methods whose name contains this string
        #[arg(short, long)]
        method: Option<String>,
        /// Include metadata-only types
        #[arg(long)]
        external: bool,
    },
    /// Write one of the built-in demo programs
    Sample {
        #[arg(value_enum)]
        program: Sample,
        output: PathBuf,
    },
    /// Write the default configuration
    Config { output: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum Sample {
    FooBar,
    TypeWide,
    Counter,
    Async,
}

fn print_messages(log: &LogChannel, verbose: bool) {
    log.set_callback(move |msg| {
        if !verbose && msg.level < LogLevel::Info {
            return;
        }
        eprintln!("[{} {:>5}] {}", msg.timepoint.format("%H:%M:%S%.3f"), msg.level, msg.message);
    });
}

fn weave(input: PathBuf, output: Option<PathBuf>, config: Option<PathBuf>, verbose: bool) -> WeaveResult<()> {
    let config = match config {
        Some(path) => WeaverConfig::load_from_toml(&path)?,
        None => WeaverConfig::load_or_default()?,
    };
    let weaver = Weaver::new(config);
    print_messages(weaver.log_channel(), verbose);

    let mut stored = StoredProgram::read_from(&input, weaver.log_channel())?;
    let report = weaver.weave(&mut stored.unit)?;
    if report.is_empty() {
        println!("Nothing to weave in {}", input.display());
        return Ok(());
    }

    stored.inputs.push(input.display().to_string());
    let output = output.unwrap_or(input);
    stored.write_to(&output, weaver.log_channel())?;

    println!(
        "Woven {} method(s), {} interceptor field(s), {} root(s) into {}",
        report.woven.len(),
        report.field_count(),
        report.roots.len(),
        output.display()
    );
    for timing in &report.timings {
        println!("  {:<18} {} ms", timing.phase, timing.elapsed.num_milliseconds());
    }
    Ok(())
}

fn dump(input: PathBuf, method: Option<String>, external: bool) -> WeaveResult<()> {
    let log = LogChannel::new();
    let stored = StoredProgram::read_from(&input, &log)?;
    let unit = &stored.unit;
    println!("// {} ({}), mvid {}", unit.name, input.display(), unit.mvid);

    for (ty, def) in unit.types() {
        if def.origin.is_external() && !external {
            continue;
        }
        match &method {
            None => println!("{}", unit.fmt_type(ty)),
            Some(filter) => {
                for (id, _) in unit.methods_of(ty).filter(|(_, m)| m.name.contains(filter.as_str())) {
                    println!("{}", unit.fmt_method(id));
                }
            }
        }
    }
    Ok(())
}

fn sample(program: Sample, output: PathBuf) -> WeaveResult<()> {
    let unit = match program {
        Sample::FooBar => tests_utils::foo_bar().unit,
        Sample::TypeWide => tests_utils::type_wide().unit,
        Sample::Counter => tests_utils::counter().unit,
        Sample::Async => tests_utils::async_service().unit,
    };
    StoredProgram::new(unit).write_to(&output, &LogChannel::new())?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn main() {
    let args = Arguments::parse();

    let result = match args.command {
        Command::Weave { input, output, config } => weave(input, output, config, args.verbose),
        Command::Dump {
            input,
            method,
            external,
        } => dump(input, method, external),
        Command::Sample { program, output } => sample(program, output),
        Command::Config { output } => WeaverConfig::default().save_to_toml(&output),
    };

    if let Err(error) = result {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}
