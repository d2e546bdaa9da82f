/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Dexing behind an explicit process boundary, with pooled dexers.

use crate::{
    error::PackagingError,
    pool::{PoolConfig, PooledWorker, WorkerPool},
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// Entry point of the dx tool inside its jar.
pub const DX_MAIN_CLASS: &str = "com.android.dx.command.Main";

/// Options forwarded to the dexer on every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DexOptions {
    /// Threads the dexer may use; `None` leaves the choice to the tool.
    pub thread_count: Option<usize>,
    pub jumbo_mode: bool,
    pub multi_dex: bool,
    pub min_sdk: Option<u32>,
    /// Extra arguments appended verbatim before the inputs.
    pub additional_parameters: Vec<String>,
}

/// One conversion: class files or jars in, dex file or directory out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexRequest {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
}

impl DexRequest {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.into(),
        }
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.inputs.push(input.into());
        self
    }
}

/// Diagnostics a finished run printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DexOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A stateful dexer that can run many requests one after another.
pub trait Dexer: Send {
    fn run(&mut self, request: &DexRequest, options: &DexOptions)
        -> Result<DexOutput, PackagingError>;
}

/// Runs the dx jar in a `java` subprocess.
#[derive(Debug, Clone)]
pub struct CommandDexer {
    java: PathBuf,
    jar: PathBuf,
}

impl CommandDexer {
    pub fn new(jar: impl Into<PathBuf>) -> Self {
        Self {
            java: PathBuf::from("java"),
            jar: jar.into(),
        }
    }

    pub fn with_java(mut self, java: impl Into<PathBuf>) -> Self {
        self.java = java.into();
        self
    }

    pub fn jar(&self) -> &Path {
        &self.jar
    }

    /// Arguments passed to `java` for `request`.
    pub fn arguments(&self, request: &DexRequest, options: &DexOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-cp".into(),
            self.jar.clone().into_os_string(),
            DX_MAIN_CLASS.into(),
            "--dex".into(),
        ];
        let mut output = OsString::from("--output=");
        output.push(&request.output);
        args.push(output);

        if options.jumbo_mode {
            args.push("--force-jumbo".into());
        }
        if let Some(threads) = options.thread_count {
            args.push(format!("--num-threads={}", threads).into());
        }
        if options.multi_dex {
            args.push("--multi-dex".into());
        }
        if let Some(min_sdk) = options.min_sdk {
            args.push(format!("--min-sdk-version={}", min_sdk).into());
        }
        args.extend(options.additional_parameters.iter().map(OsString::from));
        args.extend(request.inputs.iter().map(|p| p.clone().into_os_string()));
        args
    }
}

impl Dexer for CommandDexer {
    fn run(
        &mut self,
        request: &DexRequest,
        options: &DexOptions,
    ) -> Result<DexOutput, PackagingError> {
        if request.inputs.is_empty() {
            return Err(PackagingError::Dex("no inputs to dex".into()));
        }
        let args = self.arguments(request, options);
        trace!(java = %self.java.display(), ?args, "running dexer");

        let output = Command::new(&self.java)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                PackagingError::Dex(format!("failed to start {}: {}", self.java.display(), e))
            })?;
        let result = DexOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            return Err(PackagingError::Dex(format!(
                "dexer exited with {}: {}",
                output.status,
                result.stderr.trim()
            )));
        }
        debug!(output = %request.output.display(), "dexing finished");
        Ok(result)
    }
}

/// Dexers pooled per dexer jar, owned by the build session.
pub struct DexerPool {
    pool: WorkerPool<PathBuf, Box<dyn Dexer>>,
}

impl Default for DexerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DexerPool {
    /// Pool of [`CommandDexer`]s sized by `APKZIP_WORKER_POOL_SIZE`.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::from_env())
    }

    /// Pool of [`CommandDexer`]s.
    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_factory(config, |jar| {
            Ok(Box::new(CommandDexer::new(jar.clone())) as Box<dyn Dexer>)
        })
    }

    pub fn with_factory<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn(&PathBuf) -> Result<Box<dyn Dexer>, PackagingError> + Send + Sync + 'static,
    {
        Self {
            pool: WorkerPool::new(config, factory),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.pool.config()
    }

    pub fn obtain(&self, jar: &Path) -> Result<PooledWorker<Box<dyn Dexer>>, PackagingError> {
        self.pool.obtain(&jar.to_path_buf())
    }

    /// Run `request` on a pooled dexer for `jar`.
    pub fn run(
        &self,
        jar: &Path,
        request: &DexRequest,
        options: &DexOptions,
    ) -> Result<DexOutput, PackagingError> {
        let mut dexer = self.obtain(jar)?;
        dexer.run(request, options)
    }

    pub fn evict_expired(&self) {
        self.pool.evict_expired();
    }

    /// Dexers for `jar` currently checked out.
    pub fn checked_out(&self, jar: &Path) -> usize {
        self.pool.checked_out(&jar.to_path_buf())
    }
}
