/*!
# Introduction

mig-parted is a MIG partition editor for NVIDIA datacenter GPUs. An
operator declares a set of named MIG configurations in a single YAML or
JSON file, selects one at runtime, and mig-parted drives the node's GPUs
into exactly that partition layout: toggling MIG mode (resetting GPUs as
required), destroying existing GPU instances, and creating the requested
set.

Subcommands:
* `apply` converges the node onto the selected config.
* `assert` verifies the selected config is currently applied.
* `export` emits a canonical spec describing the current state.
* `checkpoint` writes a snapshot of the full MIG state to a file.
* `generate-config` emits a canonical spec from hardware discovery.

Every flag can also be supplied through a `MIG_PARTED_*` environment
variable, and `-f -` reads from stdin.
*/

use std::collections::BTreeMap;
use std::io::Read;
use std::str::FromStr;
use std::{env, fs, io, process};

use log::debug;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::{OptionExt, ResultExt};

use mig_parted::apply::{Applier, ApplyOptions};
use mig_parted::checkpoint;
use mig_parted::export::{export_spec, DEFAULT_EXPORT_LABEL};
use mig_parted::generate::generate_spec;
use mig_parted::hooks::HookRunner;
use mig_parted::nvml::LibNvml;
use mig_parted::types::{HookPoint, HooksSpec, Spec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Yaml,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid output format '{}'", s)),
        }
    }
}

#[derive(Debug)]
enum Subcommand {
    Apply {
        config_file: String,
        selected_config: Option<String>,
        hooks_file: Option<String>,
        mode_only: bool,
        skip_reset: bool,
    },
    Assert {
        config_file: String,
        selected_config: Option<String>,
        mode_only: bool,
        valid_config: bool,
    },
    Export {
        output_format: OutputFormat,
        config_label: String,
    },
    Checkpoint {
        checkpoint_file: String,
    },
    GenerateConfig {
        output_file: Option<String>,
        output_format: OutputFormat,
    },
}

/// Stores user-supplied global arguments
struct Args {
    debug: bool,
    subcommand: Subcommand,
}

fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "mig-parted".to_string());
    eprintln!(
        r"Usage: {program_name} [-d | --debug] <subcommand> [flags]

Subcommands:
    apply             Converge the node to the selected MIG config
        -f, --config-file FILE        Config file ('-' for stdin) [MIG_PARTED_CONFIG_FILE]
        -c, --selected-config LABEL   Config to select [MIG_PARTED_SELECTED_CONFIG]
        -k, --hooks-file FILE         Hooks file [MIG_PARTED_HOOKS_FILE]
            --mode-only               Only converge MIG mode [MIG_PARTED_MODE_CHANGE_ONLY]
            --skip-reset              Do not reset GPUs with pending changes [MIG_PARTED_SKIP_RESET]

    assert            Verify the selected MIG config is applied
        -f, --config-file FILE        Config file ('-' for stdin) [MIG_PARTED_CONFIG_FILE]
        -c, --selected-config LABEL   Config to select [MIG_PARTED_SELECTED_CONFIG]
            --mode-only               Only check MIG mode [MIG_PARTED_MODE_CHANGE_ONLY]
            --valid-config            Only check that the config parses [MIG_PARTED_VALID_CONFIG]

    export            Emit a canonical spec of the current state
        -o, --output-format json|yaml [MIG_PARTED_OUTPUT_FORMAT]
        -l, --config-label LABEL      Label for the emitted config

    checkpoint        Write a snapshot of the MIG state
        -f, --checkpoint-file FILE    Output file ('-' for stdout) [MIG_PARTED_CHECKPOINT_FILE]

    generate-config   Emit a canonical spec from hardware discovery
        -f, --output-file FILE        Output file ('-' for stdout)
        -o, --output-format json|yaml [MIG_PARTED_OUTPUT_FORMAT]

Global arguments:
    -d, --debug                       Verbose logging [MIG_PARTED_DEBUG]
        --version                     Print the version and exit"
    );
    process::exit(2);
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> bool {
    matches!(env_string(name).as_deref(), Some("true") | Some("1"))
}

/// Parse the args to the program and return an Args struct
fn parse_args(args: env::Args) -> Result<Args> {
    let mut debug = env_bool("MIG_PARTED_DEBUG");
    let mut subcommand_name = None;
    let mut rest = Vec::new();

    for arg in args.skip(1) {
        match arg.as_ref() {
            "-d" | "--debug" => debug = true,
            "-h" | "--help" => usage(),
            "--version" => {
                println!("mig-parted {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            _ if subcommand_name.is_none() && !arg.starts_with('-') => {
                subcommand_name = Some(arg)
            }
            _ => rest.push(arg),
        }
    }

    let subcommand_name = match subcommand_name {
        Some(name) => name,
        None => usage(),
    };
    let subcommand = parse_subcommand(&subcommand_name, rest)?;
    Ok(Args { debug, subcommand })
}

fn parse_subcommand(name: &str, args: Vec<String>) -> Result<Subcommand> {
    let mut config_file = env_string("MIG_PARTED_CONFIG_FILE");
    let mut selected_config = env_string("MIG_PARTED_SELECTED_CONFIG");
    let mut hooks_file = env_string("MIG_PARTED_HOOKS_FILE");
    let mut checkpoint_file = env_string("MIG_PARTED_CHECKPOINT_FILE");
    let mut output_file = None;
    let mut config_label = None;
    let mut mode_only = env_bool("MIG_PARTED_MODE_CHANGE_ONLY");
    let mut skip_reset = env_bool("MIG_PARTED_SKIP_RESET");
    let mut valid_config = env_bool("MIG_PARTED_VALID_CONFIG");
    let mut output_format = match env_string("MIG_PARTED_OUTPUT_FORMAT") {
        Some(value) => value
            .parse()
            .map_err(|message| error::Error::Usage { message })?,
        None => OutputFormat::Yaml,
    };

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "-f" | "--config-file" | "--checkpoint-file" | "--output-file" => {
                let value = iter.next().context(error::UsageSnafu {
                    message: format!("Did not give argument to {}", arg),
                })?;
                config_file = Some(value.clone());
                checkpoint_file = Some(value.clone());
                output_file = Some(value);
            }
            "-c" | "--selected-config" => {
                selected_config = Some(iter.next().context(error::UsageSnafu {
                    message: format!("Did not give argument to {}", arg),
                })?);
            }
            "-k" | "--hooks-file" => {
                hooks_file = Some(iter.next().context(error::UsageSnafu {
                    message: format!("Did not give argument to {}", arg),
                })?);
            }
            "-l" | "--config-label" => {
                config_label = Some(iter.next().context(error::UsageSnafu {
                    message: format!("Did not give argument to {}", arg),
                })?);
            }
            "-o" | "--output-format" => {
                let value = iter.next().context(error::UsageSnafu {
                    message: format!("Did not give argument to {}", arg),
                })?;
                output_format = value
                    .parse()
                    .map_err(|message| error::Error::Usage { message })?;
            }
            "--mode-only" => mode_only = true,
            "--skip-reset" => skip_reset = true,
            "--valid-config" => valid_config = true,
            _ => {
                return error::UsageSnafu {
                    message: format!("Unknown argument '{}'", arg),
                }
                .fail()
            }
        }
    }

    match name {
        "apply" => Ok(Subcommand::Apply {
            config_file: config_file.context(error::UsageSnafu {
                message: "apply requires a config file (-f)",
            })?,
            selected_config,
            hooks_file,
            mode_only,
            skip_reset,
        }),
        "assert" => Ok(Subcommand::Assert {
            config_file: config_file.context(error::UsageSnafu {
                message: "assert requires a config file (-f)",
            })?,
            selected_config,
            mode_only,
            valid_config,
        }),
        "export" => Ok(Subcommand::Export {
            output_format,
            config_label: config_label.unwrap_or_else(|| DEFAULT_EXPORT_LABEL.to_string()),
        }),
        "checkpoint" => Ok(Subcommand::Checkpoint {
            checkpoint_file: checkpoint_file.context(error::UsageSnafu {
                message: "checkpoint requires a checkpoint file (-f)",
            })?,
        }),
        "generate-config" => Ok(Subcommand::GenerateConfig {
            output_file,
            output_format,
        }),
        _ => error::UsageSnafu {
            message: format!("Unknown subcommand '{}'", name),
        }
        .fail(),
    }
}

/// Read a file's contents, with '-' meaning stdin.
fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut bytes = Vec::new();
        io::stdin()
            .read_to_end(&mut bytes)
            .context(error::ReadInputSnafu { path })?;
        Ok(bytes)
    } else {
        fs::read(path).context(error::ReadInputSnafu { path })
    }
}

/// Write output, with '-' (or nothing) meaning stdout.
fn write_output(path: Option<&str>, contents: &str) -> Result<()> {
    match path {
        None | Some("-") => {
            print!("{}", contents);
            Ok(())
        }
        Some(path) => fs::write(path, contents).context(error::WriteOutputSnafu { path }),
    }
}

fn format_spec(spec: &Spec, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(spec).context(error::SerializeYamlSnafu),
        OutputFormat::Json => {
            let mut rendered =
                serde_json::to_string_pretty(spec).context(error::SerializeJsonSnafu)?;
            rendered.push('\n');
            Ok(rendered)
        }
    }
}

fn load_selected(
    config_file: &str,
    selected_config: Option<&str>,
) -> Result<Vec<mig_parted::types::MigConfigSpec>> {
    let bytes = read_input(config_file)?;
    let spec = Spec::from_slice(&bytes).context(error::SpecSnafu)?;
    let selected = spec.select(selected_config).context(error::SpecSnafu)?.to_vec();
    Ok(selected)
}

fn run_apply(
    config_file: &str,
    selected_config: Option<&str>,
    hooks_file: Option<&str>,
    mode_only: bool,
    skip_reset: bool,
) -> Result<()> {
    let selected = load_selected(config_file, selected_config)?;

    let hooks_spec = match hooks_file {
        Some(path) => {
            HooksSpec::from_slice(&read_input(path)?).context(error::HooksSpecSnafu)?
        }
        None => HooksSpec::default(),
    };
    let mut hook_envs = BTreeMap::new();
    hook_envs.insert("MIG_PARTED_CONFIG_FILE".to_string(), config_file.to_string());
    if let Some(label) = selected_config {
        hook_envs.insert("MIG_PARTED_SELECTED_CONFIG".to_string(), label.to_string());
    }
    let hooks = HookRunner::new(hooks_spec, hook_envs);

    let nvml = LibNvml::new().context(error::NvmlSnafu)?;
    let applier = Applier::new(&nvml).context(error::ApplySnafu)?;

    let result = (|| -> Result<()> {
        hooks.run(HookPoint::ApplyStart).context(error::HooksSnafu)?;

        hooks
            .run(HookPoint::PreApplyMode)
            .context(error::HooksSnafu)?;
        let pending = applier
            .apply_mig_mode(&selected)
            .context(error::ApplySnafu)?;
        if !pending.is_empty() {
            if skip_reset {
                debug!("skipping reset of GPUs {:?}", pending);
            } else {
                applier.reset_gpus(&pending).context(error::ApplySnafu)?;
            }
        }

        if !mode_only {
            hooks
                .run(HookPoint::PreApplyConfig)
                .context(error::HooksSnafu)?;
            applier
                .apply_mig_config(&selected)
                .context(error::ApplySnafu)?;
        }
        Ok(())
    })();

    // The exit hook always runs; its failure never masks an earlier error.
    let exit_result = hooks.run(HookPoint::ApplyExit).context(error::HooksSnafu);
    result.and(exit_result)
}

fn run_assert(
    config_file: &str,
    selected_config: Option<&str>,
    mode_only: bool,
    valid_config: bool,
) -> Result<()> {
    let selected = load_selected(config_file, selected_config)?;
    if valid_config {
        return Ok(());
    }

    let nvml = LibNvml::new().context(error::NvmlSnafu)?;
    let applier = Applier::new(&nvml).context(error::ApplySnafu)?;
    applier
        .assert(
            &selected,
            ApplyOptions {
                mode_only,
                skip_reset: false,
            },
        )
        .context(error::ApplySnafu)
}

fn run(args: Args) -> Result<()> {
    // SimpleLogger will send errors to stderr and anything less to stdout.
    let log_level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::init(log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    match args.subcommand {
        Subcommand::Apply {
            config_file,
            selected_config,
            hooks_file,
            mode_only,
            skip_reset,
        } => run_apply(
            &config_file,
            selected_config.as_deref(),
            hooks_file.as_deref(),
            mode_only,
            skip_reset,
        ),
        Subcommand::Assert {
            config_file,
            selected_config,
            mode_only,
            valid_config,
        } => run_assert(
            &config_file,
            selected_config.as_deref(),
            mode_only,
            valid_config,
        ),
        Subcommand::Export {
            output_format,
            config_label,
        } => {
            let nvml = LibNvml::new().context(error::NvmlSnafu)?;
            let spec = export_spec(&nvml, &config_label).context(error::ExportSnafu)?;
            write_output(None, &format_spec(&spec, output_format)?)
        }
        Subcommand::Checkpoint { checkpoint_file } => {
            let nvml = LibNvml::new().context(error::NvmlSnafu)?;
            let snapshot = checkpoint::take(&nvml).context(error::CheckpointSnafu)?;
            let mut rendered = checkpoint::to_json(&snapshot).context(error::CheckpointSnafu)?;
            rendered.push('\n');
            write_output(Some(&checkpoint_file), &rendered)
        }
        Subcommand::GenerateConfig {
            output_file,
            output_format,
        } => {
            let nvml = LibNvml::new().context(error::NvmlSnafu)?;
            let spec = generate_spec(&nvml).context(error::GenerateSnafu)?;
            write_output(output_file.as_deref(), &format_spec(&spec, output_format)?)
        }
    }
}

fn main() {
    let args = match parse_args(env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            usage();
        }
    };

    if let Err(e) = run(args) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", message))]
        Usage { message: String },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Unable to read '{}': {}", path, source))]
        ReadInput {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("Unable to write '{}': {}", path, source))]
        WriteOutput {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("{}", source))]
        Spec {
            source: mig_parted::types::spec::Error,
        },

        #[snafu(display("Unable to parse hooks file: {}", source))]
        HooksSpec {
            source: mig_parted::types::hooks::Error,
        },

        #[snafu(display("{}", source))]
        Hooks { source: mig_parted::hooks::Error },

        #[snafu(display("Unable to load NVML: {}", source))]
        Nvml { source: mig_parted::nvml::Error },

        #[snafu(display("{}", source))]
        Apply { source: mig_parted::apply::Error },

        #[snafu(display("{}", source))]
        Export { source: mig_parted::export::Error },

        #[snafu(display("{}", source))]
        Checkpoint {
            source: mig_parted::checkpoint::Error,
        },

        #[snafu(display("{}", source))]
        Generate {
            source: mig_parted::generate::Error,
        },

        #[snafu(display("Unable to serialize spec: {}", source))]
        SerializeYaml { source: serde_yaml::Error },

        #[snafu(display("Unable to serialize spec: {}", source))]
        SerializeJson { source: serde_json::Error },
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
