/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Configuration parsing and validation for the apkzip CLI.

use crate::{error::PackagingError, signing::SigningConfig, ui::Ui};
use clap::ArgMatches;
use std::path::{Path, PathBuf};

/// Execution mode for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Sign an archive, optionally rewriting the input in place
    Sign { inplace: bool },
    /// Verify an archive's signatures
    Verify,
}

/// Application configuration parsed from command-line arguments.
#[derive(Debug)]
pub struct Config {
    /// Path to the input file to process
    pub input_path: PathBuf,
    /// Path where the output should be written (the input in verify mode)
    pub output_path: PathBuf,
    pub mode: Mode,
    /// Path to custom private key file (if provided)
    pub key_path: Option<PathBuf>,
    /// Path to custom certificate file (if provided)
    pub cert_path: Option<PathBuf>,
    /// Whether to overwrite existing output files
    pub overwrite: bool,
    /// Whether to suppress non-error output
    pub quiet: bool,
    pub verbose: bool,
    /// Verbosity level (0 = off, 1 = verbose, 2 = very verbose, 3+ = debug)
    pub verbosity_level: u8,
    pub signing: SigningConfig,
    /// Compression threads; `None` compresses on the calling thread
    pub threads: Option<usize>,
    /// Keep entry timestamps instead of writing the DOS epoch
    pub keep_timestamps: bool,
}

impl Config {
    /// Parse configuration from command-line argument matches.
    pub fn from_matches(matches: &ArgMatches, ui: &Ui) -> Result<Self, PackagingError> {
        let quiet = matches.get_flag("quiet");
        let verbosity_level = matches.get_count("verbose");

        match matches.subcommand() {
            Some(("sign", sub_matches)) => Self::parse_sign(sub_matches, quiet, verbosity_level, ui),
            Some(("verify", sub_matches)) => {
                Self::parse_verify(sub_matches, quiet, verbosity_level, ui)
            }
            _ => Err(PackagingError::Config(
                "No subcommand provided. Use 'sign' or 'verify'.".into(),
            )),
        }
    }

    fn parse_sign(
        matches: &ArgMatches,
        quiet: bool,
        verbosity_level: u8,
        ui: &Ui,
    ) -> Result<Self, PackagingError> {
        let input_path = existing_input(matches, ui)?;
        let inplace = matches.get_flag("inplace");

        let output_path = if inplace {
            if matches.get_one::<String>("output").is_some() {
                return Err(PackagingError::Config(
                    "Cannot combine --inplace with an output path.".into(),
                ));
            }
            input_path.clone()
        } else if let Some(out) = matches.get_one::<String>("output") {
            PathBuf::from(out)
        } else {
            default_output(&input_path)?
        };
        ui.trace(&format!("Using output file: {}", output_path.display()));

        let key_path = optional_file(matches, "private_key", "Private key", ui)?;
        let cert_path = optional_file(matches, "public_key", "Certificate", ui)?;
        if key_path.is_some() != cert_path.is_some() {
            return Err(PackagingError::Config(
                "A custom private key and certificate must be given together.".into(),
            ));
        }

        let mut signing = SigningConfig::default();
        if let Some(min_sdk) = matches.get_one::<u32>("min_sdk") {
            signing.min_sdk = *min_sdk;
        }
        signing.v1_enabled = !matches.get_flag("no_v1");
        signing.v2_enabled = !matches.get_flag("no_v2");
        if !signing.v1_enabled && !signing.v2_enabled {
            return Err(PackagingError::Config(
                "--no-v1 and --no-v2 leave nothing to sign.".into(),
            ));
        }

        let threads = match matches.get_one::<usize>("threads").copied() {
            Some(0) => {
                return Err(PackagingError::Config(
                    "--threads must be at least 1.".into(),
                ))
            }
            other => other,
        };

        Ok(Self {
            input_path,
            output_path,
            mode: Mode::Sign { inplace },
            key_path,
            cert_path,
            overwrite: matches.get_flag("overwrite"),
            quiet,
            verbose: verbosity_level > 0,
            verbosity_level,
            signing,
            threads,
            keep_timestamps: matches.get_flag("timestamps"),
        })
    }

    fn parse_verify(
        matches: &ArgMatches,
        quiet: bool,
        verbosity_level: u8,
        ui: &Ui,
    ) -> Result<Self, PackagingError> {
        let input_path = existing_input(matches, ui)?;
        let cert_path = optional_file(matches, "public_key", "Certificate", ui)?;

        Ok(Self {
            output_path: input_path.clone(),
            input_path,
            mode: Mode::Verify,
            key_path: None,
            cert_path,
            overwrite: false,
            quiet,
            verbose: verbosity_level > 0,
            verbosity_level,
            signing: SigningConfig::default(),
            threads: None,
            keep_timestamps: false,
        })
    }
}

fn existing_input(matches: &ArgMatches, ui: &Ui) -> Result<PathBuf, PackagingError> {
    let path = PathBuf::from(
        matches
            .get_one::<String>("input")
            .ok_or_else(|| PackagingError::Config("No input file specified".into()))?,
    );
    let metadata = std::fs::metadata(&path).map_err(|e| {
        PackagingError::Config(format!("Cannot access input file {}: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(PackagingError::Config(format!(
            "Input is not a file: {}",
            path.display()
        )));
    }
    ui.trace(&format!("Using input file: {}", path.display()));
    Ok(path)
}

fn optional_file(
    matches: &ArgMatches,
    id: &str,
    what: &str,
    ui: &Ui,
) -> Result<Option<PathBuf>, PackagingError> {
    let Some(value) = matches.get_one::<String>(id) else {
        ui.trace(&format!("{}: using the development default", what));
        return Ok(None);
    };
    let path = PathBuf::from(value);
    if !path.exists() {
        return Err(PackagingError::Config(format!(
            "{} file does not exist: {}",
            what,
            path.display()
        )));
    }
    ui.trace(&format!("{}: {}", what, path.display()));
    Ok(Some(path))
}

/// `app.apk` becomes `app_signed.apk`; extensionless inputs get `.zip`.
fn default_output(input: &Path) -> Result<PathBuf, PackagingError> {
    let stem = input.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
        PackagingError::Config(format!(
            "Invalid input filename (no stem or non-UTF8): {}",
            input.display()
        ))
    })?;
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("zip");
    Ok(input.with_file_name(format!("{}_signed.{}", stem, extension)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_keeps_extension() {
        assert_eq!(
            default_output(Path::new("out/app.apk")).unwrap(),
            PathBuf::from("out/app_signed.apk")
        );
        assert_eq!(
            default_output(Path::new("bundle")).unwrap(),
            PathBuf::from("bundle_signed.zip")
        );
    }
}
