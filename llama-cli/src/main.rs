use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use log::error;
use llama_inference::{RunConfig, run};

/// Arguments shared by the `forward` and `generate` subcommands.
fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("parameters")
                .help("Model parameters as a JSON object of GGUF-style keys")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokens")
                .short('t')
                .long("tokens")
                .value_name("IDS")
                .help("Comma-separated prompt token ids, e.g. 1,50,7")
                .value_delimiter(',')
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt, encoded with the vocabulary from the parameters"),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Seed of the random weights")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("KV cache capacity, (default) = context_length parameter")
                .value_parser(clap::value_parser!(usize)),
        )
}

/// Define the forward subcommand.
fn forward_subcommand() -> Command {
    common_args(Command::new("forward").about("Run a single forward pass and print the top logits")).arg(
        Arg::new("top-k")
            .short('k')
            .long("top-k")
            .value_name("INT")
            .help("Number of logits to print")
            .default_value("5")
            .value_parser(clap::value_parser!(usize)),
    )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    common_args(Command::new("generate").about("Greedy decoding from a prompt")).arg(
        Arg::new("steps")
            .short('n')
            .long("steps")
            .value_name("INT")
            .help("Number of tokens to generate")
            .default_value("16")
            .value_parser(clap::value_parser!(usize)),
    )
}

/// Run a subcommand with the provided arguments
fn run_command(mode: &str, matches: &ArgMatches) -> Result<()> {
    let config = RunConfig::builder()
        .parameters_path(matches.get_one::<String>("parameters"))
        .mode(Some(mode))
        .tokens(matches.get_many::<i32>("tokens").map(|ids| ids.copied().collect()))
        .prompt(matches.get_one::<String>("input"))
        .seed(matches.get_one::<u64>("seed").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .steps(matches.try_get_one::<usize>("steps").ok().flatten().copied())
        .top_k(matches.try_get_one::<usize>("top-k").ok().flatten().copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run(config).map_err(|e| anyhow::anyhow!("Run failed: {e:#}"))?;

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("llama")
        .about("LLaMA CLI: runs the decoder forward pass over random weights")
        .subcommand(forward_subcommand())
        .subcommand(generate_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("forward", matches)) => run_command("forward", matches),
        Some(("generate", matches)) => run_command("generate", matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
