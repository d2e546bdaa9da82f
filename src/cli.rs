/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::{
    config::{Config, Mode},
    crypto::CryptoEngine,
    digest::DigestAlgorithm,
    error::PackagingError,
    keys::KeyChain,
    signing::{ApkSigner, SigningReport},
    ui::{Ui, Verbosity},
    verification::{ArtifactVerifier, VerificationReport},
    zfile::{AlignmentRule, ZFileOptions},
    *,
};
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::Path;

/// The command line definition.
pub fn command() -> Command {
    Command::new(APP_NAME)
        .bin_name(APP_BIN_NAME)
        .version(APP_VERSION)
        .author(APP_AUTHOR)
        .about(APP_ABOUT)
        .disable_version_flag(true)
        .help_template("{about-with-newline}{usage-heading} {usage}\n\n{all-args}\n")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("sign")
                .about("Sign an APK, JAR or ZIP archive (v1 and v2)")
                .arg_required_else_help(true)
                .arg(
                    Arg::new("input")
                        .required(true)
                        .help("Path to the archive to sign")
                        .index(1),
                )
                .arg(
                    Arg::new("output")
                        .help("Path to save the signed archive (optional)")
                        .index(2),
                )
                .arg(
                    Arg::new("private_key")
                        .short('k')
                        .long("private-key")
                        .help("Custom private key (PEM/PK8, RSA or EC P-256)"),
                )
                .arg(
                    Arg::new("public_key")
                        .short('p')
                        .long("public-key")
                        .help("Certificate matching the private key (PEM/DER X.509)"),
                )
                .arg(
                    Arg::new("min_sdk")
                        .long("min-sdk")
                        .value_parser(value_parser!(u32))
                        .help("Lowest Android API level that must accept the signature"),
                )
                .arg(
                    Arg::new("no_v1")
                        .long("no-v1")
                        .action(ArgAction::SetTrue)
                        .help("Skip the JAR (v1) signature"),
                )
                .arg(
                    Arg::new("no_v2")
                        .long("no-v2")
                        .action(ArgAction::SetTrue)
                        .help("Skip the APK Signature Scheme v2 block"),
                )
                .arg(
                    Arg::new("threads")
                        .long("threads")
                        .value_parser(value_parser!(usize))
                        .help("Compress entries on this many threads"),
                )
                .arg(
                    Arg::new("timestamps")
                        .long("timestamps")
                        .action(ArgAction::SetTrue)
                        .help("Keep entry timestamps (output is no longer reproducible)"),
                )
                .arg(
                    Arg::new("overwrite")
                        .short('f')
                        .long("overwrite")
                        .action(ArgAction::SetTrue)
                        .help("Force overwrite if output exists"),
                )
                .arg(
                    Arg::new("inplace")
                        .short('i')
                        .long("inplace")
                        .action(ArgAction::SetTrue)
                        .help("Sign the input file directly (keeps a backup until done)"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify the v1 and v2 signatures of an archive")
                .arg_required_else_help(true)
                .arg(
                    Arg::new("input")
                        .required(true)
                        .help("Path to the archive to verify")
                        .index(1),
                )
                .arg(
                    Arg::new("public_key")
                        .short('p')
                        .long("public-key")
                        .help("Require the signer to use this certificate (PEM/DER)"),
                ),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Set verbosity level (-v for verbose, -vv for more verbose, -vvv for debug)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Suppress all output except errors"),
        )
        .arg(
            Arg::new("version_custom")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print version information"),
        )
}

pub fn run() -> Result<(), PackagingError> {
    let matches = command().get_matches();

    if matches.get_flag("version_custom") {
        Ui::default().version_info();
        return Ok(());
    }

    let verbosity_level = matches.get_count("verbose");
    let quiet = matches.get_flag("quiet");
    let ui = Ui::new(Verbosity::from_flags(verbosity_level, quiet), true);
    if ui.shows(Verbosity::Debug) {
        init_tracing();
    }
    ui.banner();

    let config = Config::from_matches(&matches, &ui)?;
    match config.mode {
        Mode::Verify => run_verify(&config, &ui),
        Mode::Sign { inplace } => run_sign(&config, inplace, &ui),
    }
}

/// Library events on stderr, filtered by `RUST_LOG` (default `apkzip=debug`).
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("apkzip=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_verify(config: &Config, ui: &Ui) -> Result<(), PackagingError> {
    ui.section("VERIFICATION MODE");
    ui.step(&format!(
        "Verifying integrity: {}",
        config.input_path.display()
    ));

    let expected = config
        .cert_path
        .as_deref()
        .map(std::fs::read)
        .transpose()?;
    if let Some(ref cert_path) = config.cert_path {
        ui.detail(&format!("Expecting signer certificate: {}", cert_path.display()));
    }

    ui.begin_stage("Verifying signatures...");
    let result = ArtifactVerifier::verify(&config.input_path, expected.as_deref());
    ui.end_stage();
    let report = result?;

    ui.success("Signature valid. Artifact authentic.");
    ui.report("Verification Report", &verification_fields(&report));
    Ok(())
}

fn verification_fields(report: &VerificationReport) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    match &report.v1 {
        Some(v1) => fields.push((
            "v1 (JAR)",
            format!("{} entries, {}", v1.entries_verified, v1.signature_file),
        )),
        None => fields.push(("v1 (JAR)", "absent".to_string())),
    }
    match &report.v2 {
        Some(signers) => fields.push((
            "v2 (APK)",
            signers
                .iter()
                .map(|s| s.algorithm.signing_algorithm_name())
                .collect::<Vec<_>>()
                .join(", "),
        )),
        None => fields.push(("v2 (APK)", "absent".to_string())),
    }
    if let Some(cert) = report.signer_certificate() {
        fields.push(("Signer SHA-256", fingerprint(cert)));
    }
    fields
}

fn fingerprint(cert: &[u8]) -> String {
    CryptoEngine::digest(DigestAlgorithm::Sha256, cert)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn zfile_options(config: &Config) -> Result<ZFileOptions, PackagingError> {
    let is_apk = config
        .input_path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("apk"));
    let rule = if is_apk {
        AlignmentRule::apk()
    } else {
        AlignmentRule::none()
    };
    let options = ZFileOptions::new()
        .with_no_timestamps(!config.keep_timestamps)
        .with_alignment_rule(rule);
    match config.threads {
        Some(threads) => options.with_threads(threads),
        None => Ok(options),
    }
}

fn run_sign(config: &Config, inplace: bool, ui: &Ui) -> Result<(), PackagingError> {
    ui.step("Loading keys...");
    let keys = KeyChain::load(config.key_path.as_deref(), config.cert_path.as_deref())?;
    match config.key_path {
        Some(ref key_path) => ui.detail(&format!("Using custom private key: {}", key_path.display())),
        None => ui.detail("Using default development private key"),
    }
    ui.key_info(&format!(
        "Key: {:?}, {} bits",
        keys.key_algorithm(),
        keys.key_bits()
    ));

    ui.section("SIGNING MODE");
    ui.step(&format!("Source: {}", config.input_path.display()));
    ui.step(&format!("Target: {}", config.output_path.display()));

    if !inplace && config.output_path.exists() && !config.overwrite {
        return Err(PackagingError::Config(format!(
            "Output exists: {}. Use --overwrite.",
            config.output_path.display()
        )));
    }

    let signer = ApkSigner::new(&keys, config.signing.clone());
    let options = zfile_options(config)?;

    let report = if inplace {
        sign_in_place(&signer, &config.input_path, options, ui)?
    } else {
        ui.begin_stage("Signing artifact...");
        let result = signer.sign_file(&config.input_path, &config.output_path, options);
        ui.end_stage();
        if result.is_err() && config.output_path.exists() {
            let _ = std::fs::remove_file(&config.output_path);
        }
        result?
    };

    ui.success("Archive successfully signed.");
    let key_type = if config.key_path.is_some() {
        "Custom"
    } else {
        "apkzip Dev"
    };
    let mut fields = vec![
        ("Status", "Success".to_string()),
        ("Mode", if inplace { "In-Place" } else { "Standard" }.to_string()),
        ("Output", config.output_path.display().to_string()),
        ("Key Used", key_type.to_string()),
    ];
    fields.extend(signing_fields(&report));
    ui.report("Signing Report", &fields);
    Ok(())
}

fn sign_in_place(
    signer: &ApkSigner<'_>,
    input: &Path,
    options: ZFileOptions,
    ui: &Ui,
) -> Result<SigningReport, PackagingError> {
    let backup = input.with_extension("bak");
    ui.detail(&format!(
        "Creating backup: {} -> {}",
        input.display(),
        backup.display()
    ));
    std::fs::copy(input, &backup)?;

    ui.begin_stage("Signing artifact...");
    let result = signer.sign_file(input, input, options);
    ui.end_stage();

    match result {
        Ok(report) => {
            std::fs::remove_file(&backup)?;
            Ok(report)
        }
        Err(e) => match std::fs::rename(&backup, input) {
            Ok(_) => {
                ui.error("Original file restored from backup.");
                Err(e)
            }
            Err(restore_err) => Err(PackagingError::Config(format!(
                "Signing failed AND restore failed. Error: {}. Restore: {}. Backup: {}",
                e,
                restore_err,
                backup.display()
            ))),
        },
    }
}

fn signing_fields(report: &SigningReport) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(digest) = report.digest_algorithm {
        fields.push((
            "v1 (JAR)",
            format!(
                "{} entries, {}",
                report.entries_digested,
                digest.message_digest_name()
            ),
        ));
    }
    if !report.v2_algorithms.is_empty() {
        fields.push((
            "v2 (APK)",
            report
                .v2_algorithms
                .iter()
                .map(|a| a.signing_algorithm_name())
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }
    fields.push((
        "Peak buffers",
        format!("{} KiB", report.max_bytes_tracked.div_ceil(1024)),
    ));
    fields
}
