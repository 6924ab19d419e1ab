use anyhow::Result;
use clap::{Parser, Subcommand};
use vision::{BenchmarkCliArgs, BenchmarkConfig, VisionCliArgs, VisionConfig};

/// Camera-fed object detection with live performance telemetry.
#[derive(Debug, Parser)]
#[command(name = "rt-detect", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run real-time detection on a capture source.
    Run(VisionCliArgs),
    /// Measure backend latency and sustained throughput on synthetic frames.
    Benchmark(BenchmarkCliArgs),
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = VisionConfig::try_from(args)?;
            vision::run(config)
        }
        Command::Benchmark(args) => {
            let config = BenchmarkConfig::try_from(args)?;
            vision::pipeline::benchmark::run(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_subcommand_accepts_positional_source() {
        let cli = Cli::try_parse_from(["rt-detect", "run", "synthetic:10", "--max-frames", "5"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = VisionConfig::try_from(args).unwrap();
        assert_eq!(config.source, "synthetic:10");
        assert_eq!(config.max_frames, Some(5));
    }

    #[test]
    fn benchmark_subcommand_parses_sizes() {
        let cli = Cli::try_parse_from(["rt-detect", "benchmark", "--size", "320x320", "--iterations", "5"])
            .unwrap();
        let Command::Benchmark(args) = cli.command else {
            panic!("expected benchmark subcommand");
        };
        assert_eq!(args.sizes, vec![(320, 320)]);
        assert_eq!(args.iterations, 5);
    }
}
