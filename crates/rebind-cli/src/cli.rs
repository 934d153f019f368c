//! Command line definition

use crate::logging::Verbosity;
use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rebind_core::{RulesConfig, RunConfig, TextEncoding, UpgradeSettings};
use rebind_pickle::Protocol;
use rebind_store::Oid;
use std::path::PathBuf;

pub(crate) fn command() -> Command {
    Command::new("rebind")
        .version(rebind_core::VERSION)
        .about("Updates all references to classes to their canonical location.")
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Snapshot store to update"),
        )
        .arg(
            Arg::new("dry-run")
                .short('n')
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Perform a trial run with no changes made"),
        )
        .arg(
            Arg::new("rules")
                .short('r')
                .long("rules")
                .value_parser(value_parser!(PathBuf))
                .help("TOML file with renames, decoders, skip list and type catalog"),
        )
        .arg(
            Arg::new("save-renames")
                .short('s')
                .long("save-renames")
                .value_parser(value_parser!(PathBuf))
                .help("Save automatically determined rename rules to this file"),
        )
        .arg(
            Arg::new("oid")
                .short('o')
                .long("oid")
                .help("Start with the record of this oid, e.g. 0x00"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Pause on fatal errors before aborting"),
        )
        .arg(
            Arg::new("pickle-protocol")
                .long("pickle-protocol")
                .default_value("3")
                .value_parser(value_parser!(u8).range(2..=4))
                .help("Pickle protocol used for rewritten records"),
        )
        .arg(
            Arg::new("repickle-all")
                .long("repickle-all")
                .action(ArgAction::SetTrue)
                .help("Write every record back, changed or not"),
        )
        .arg(
            Arg::new("upgrade")
                .long("upgrade")
                .action(ArgAction::SetTrue)
                .help("Convert records written by Python 2 for Python 3 hosts"),
        )
        .arg(
            Arg::new("encoding")
                .long("encoding")
                .requires("upgrade")
                .help("Decode remaining Python 2 strings with this encoding"),
        )
        .arg(
            Arg::new("encoding-fallback")
                .long("encoding-fallback")
                .action(ArgAction::Append)
                .requires("encoding")
                .help("Encoding tried when decoding fails, may be repeated"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose")
                .help("Suppress non-error messages"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log every processed record"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the run summary as JSON"),
        )
}

/// Parsed invocation
#[derive(Debug)]
pub(crate) struct Options {
    pub(crate) file: PathBuf,
    pub(crate) rules: Option<PathBuf>,
    pub(crate) save_renames: Option<PathBuf>,
    pub(crate) verbosity: Verbosity,
    pub(crate) json: bool,
    pub(crate) config: RunConfig,
    encoding: Option<TextEncoding>,
    fallbacks: Vec<TextEncoding>,
}

impl Options {
    pub(crate) fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let verbosity = if matches.get_flag("quiet") {
            Verbosity::Quiet
        } else if matches.get_flag("verbose") {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        };

        let protocol = matches
            .get_one::<u8>("pickle-protocol")
            .copied()
            .map(Protocol::new)
            .transpose()?
            .unwrap_or_default();

        let mut config = RunConfig::new()
            .with_dry_run(matches.get_flag("dry-run"))
            .with_protocol(protocol)
            .with_repickle_all(matches.get_flag("repickle-all"))
            .with_debug(matches.get_flag("debug"));
        if let Some(text) = matches.get_one::<String>("oid") {
            let oid = Oid::parse_repr(text).with_context(|| format!("invalid --oid '{text}'"))?;
            config = config.with_start_at(oid);
        }

        let encoding = matches
            .get_one::<String>("encoding")
            .map(|label| label.parse::<TextEncoding>())
            .transpose()?;
        let fallbacks = matches
            .get_many::<String>("encoding-fallback")
            .unwrap_or_default()
            .map(|label| label.parse::<TextEncoding>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut options = Self {
            file: matches
                .get_one::<PathBuf>("file")
                .cloned()
                .context("--file is required")?,
            rules: matches.get_one::<PathBuf>("rules").cloned(),
            save_renames: matches.get_one::<PathBuf>("save-renames").cloned(),
            verbosity,
            json: matches.get_flag("json"),
            config,
            encoding,
            fallbacks,
        };
        if matches.get_flag("upgrade") {
            options.config = options.config.clone().with_upgrade(options.upgrade(&[]));
        }
        Ok(options)
    }

    /// Upgrade settings, taking fallbacks from `rules` when none were given
    fn upgrade(&self, rule_fallbacks: &[TextEncoding]) -> UpgradeSettings {
        let mut settings = UpgradeSettings::new();
        if let Some(encoding) = self.encoding {
            settings = settings.with_encoding(encoding);
        }
        let fallbacks = if self.fallbacks.is_empty() {
            rule_fallbacks.to_vec()
        } else {
            self.fallbacks.clone()
        };
        settings.with_fallbacks(fallbacks)
    }

    /// Run configuration completed with the rules file
    pub(crate) fn run_config(&self, rules: &RulesConfig) -> Result<RunConfig> {
        let mut config = self.config.clone();
        if config.upgrade.is_some() {
            config = config.with_upgrade(self.upgrade(&rules.fallbacks()?));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Options> {
        let matches = command().try_get_matches_from(
            std::iter::once("rebind").chain(args.iter().copied()),
        )?;
        Options::from_matches(&matches)
    }

    #[test]
    fn command_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn defaults() {
        let options = parse(&["-f", "store.json"]).unwrap();
        assert_eq!(options.file, PathBuf::from("store.json"));
        assert_eq!(options.verbosity, Verbosity::Normal);
        assert!(!options.config.dry_run);
        assert_eq!(options.config.protocol, Protocol::V3);
        assert_eq!(options.config.start_at, Oid::ZERO);
        assert!(options.config.upgrade.is_none());
        assert!(!options.json);
    }

    #[test]
    fn file_is_required() {
        assert!(parse(&["-n"]).is_err());
    }

    #[test]
    fn run_flags() {
        let options = parse(&[
            "-f",
            "store.json",
            "-n",
            "-q",
            "-d",
            "-o",
            "0x1f",
            "--pickle-protocol",
            "2",
            "--repickle-all",
        ])
        .unwrap();
        assert!(options.config.dry_run);
        assert!(options.config.debug);
        assert!(options.config.repickle_all);
        assert_eq!(options.config.start_at, Oid::from_u64(31));
        assert_eq!(options.config.protocol, Protocol::V2);
        assert_eq!(options.verbosity, Verbosity::Quiet);
    }

    #[test]
    fn protocol_out_of_range() {
        assert!(parse(&["-f", "s", "--pickle-protocol", "5"]).is_err());
        assert!(parse(&["-f", "s", "--pickle-protocol", "1"]).is_err());
    }

    #[test]
    fn invalid_oid() {
        assert!(parse(&["-f", "s", "-o", "0xzz"]).is_err());
    }

    #[test]
    fn encoding_requires_upgrade() {
        assert!(parse(&["-f", "s", "--encoding", "utf-8"]).is_err());
        assert!(parse(&["-f", "s", "--upgrade", "--encoding", "klingon"]).is_err());
    }

    #[test]
    fn upgrade_settings_prefer_command_line_fallbacks() {
        let options = parse(&[
            "-f",
            "s",
            "--upgrade",
            "--encoding",
            "ascii",
            "--encoding-fallback",
            "latin-1",
            "--encoding-fallback",
            "cp1252",
        ])
        .unwrap();
        let rules = RulesConfig::from_toml_str("encoding_fallbacks = [\"utf-8\"]").unwrap();
        let upgrade = options.run_config(&rules).unwrap().upgrade.unwrap();
        assert_eq!(upgrade.encoding, Some(TextEncoding::Ascii));
        assert_eq!(
            upgrade.fallbacks,
            vec![TextEncoding::Latin1, TextEncoding::Cp1252]
        );

        let options = parse(&["-f", "s", "--upgrade", "--encoding", "ascii"]).unwrap();
        let upgrade = options.run_config(&rules).unwrap().upgrade.unwrap();
        assert_eq!(upgrade.fallbacks, vec![TextEncoding::Utf8]);
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(parse(&["-f", "s", "-q", "-v"]).is_err());
    }
}
