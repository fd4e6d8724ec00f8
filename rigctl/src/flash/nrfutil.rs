//! `adafruit-nrfutil` driver.
//!
//! Packages an Intel HEX application into a DFU zip and uploads it over the
//! bootloader's serial port. The tool runs as a child process; its output is
//! only surfaced when it fails.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use log::{debug, info};

use super::FirmwareTool;
use crate::error::{Error, Result};
use crate::port::PortEnumerator;

/// nRF52 device type passed to `dfu genpkg`.
pub const DEFAULT_DEV_TYPE: &str = "0x0052";

/// Python module name used when no wrapper script is on PATH.
const PYTHON_MODULE: &str = "adafruit_nrfutil";

/// A resolved way of invoking nrfutil.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    program: PathBuf,
    prefix: Vec<OsString>,
}

impl Launcher {
    /// Run `program` directly.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Run `python -m adafruit_nrfutil` through the given interpreter.
    pub fn python_module(python: impl Into<PathBuf>) -> Self {
        Self {
            program: python.into(),
            prefix: vec!["-m".into(), PYTHON_MODULE.into()],
        }
    }

    /// Locate nrfutil: wrapper scripts on PATH first, then a Python launcher.
    pub fn resolve() -> Result<Self> {
        for name in ["adafruit-nrfutil", "nrfutil"] {
            if let Ok(path) = which::which(name) {
                return Ok(Self::program(path));
            }
        }
        if cfg!(windows) && which::which("py").is_ok() {
            return Ok(Self::python_module("py"));
        }
        for python in ["python", "python3"] {
            if let Ok(path) = which::which(python) {
                return Ok(Self::python_module(path));
            }
        }
        Err(Error::ToolNotFound(
            "adafruit-nrfutil (install with 'pip install adafruit-nrfutil')".into(),
        ))
    }

    /// Program that gets executed.
    pub fn program_path(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix).args(args);
        cmd
    }

    fn describe(&self, args: &[OsString]) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.prefix.iter().map(OsString::as_os_str))
            .chain(args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Arguments of `dfu genpkg`.
pub fn genpkg_args(dev_type: &str, firmware: &Path, package: &Path, sd_req: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "dfu".into(),
        "genpkg".into(),
        "--dev-type".into(),
        dev_type.into(),
        "--application".into(),
        firmware.into(),
    ];
    if sd_req {
        args.push("--sd-req".into());
        args.push("0x00".into());
    }
    args.push(package.into());
    args
}

/// Arguments of `dfu serial`.
pub fn serial_args(package: &Path, port: &str, baud_rate: u32) -> Vec<OsString> {
    vec![
        "dfu".into(),
        "serial".into(),
        "--package".into(),
        package.into(),
        "-p".into(),
        port.into(),
        "-b".into(),
        baud_rate.to_string().into(),
        "--singlebank".into(),
    ]
}

/// Zip path for `firmware` inside `dir`: the image's stem with `.zip`.
pub fn package_path(dir: &Path, firmware: &Path) -> PathBuf {
    let stem = firmware
        .file_stem()
        .map_or_else(|| OsString::from("firmware"), OsString::from);
    let mut name = stem;
    name.push(".zip");
    dir.join(name)
}

/// Diagnostic text of a finished process: stderr, or stdout when stderr is empty.
fn diagnostics(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

/// [`FirmwareTool`] backed by `adafruit-nrfutil`.
pub struct Nrfutil {
    launcher: Option<Launcher>,
    dev_type: String,
    work_dir: PathBuf,
    enumerator: Arc<dyn PortEnumerator>,
}

impl Nrfutil {
    /// Resolve the launcher lazily; packages go to the system temp dir.
    ///
    /// `enumerator` supplies a port when the caller has none.
    pub fn new(enumerator: Arc<dyn PortEnumerator>) -> Self {
        Self {
            launcher: None,
            dev_type: DEFAULT_DEV_TYPE.to_string(),
            work_dir: std::env::temp_dir(),
            enumerator,
        }
    }

    /// Use an explicit launcher instead of searching PATH.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Override the `--dev-type` value.
    #[must_use]
    pub fn with_dev_type(mut self, dev_type: impl Into<String>) -> Self {
        self.dev_type = dev_type.into();
        self
    }

    /// Directory for the generated package.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn launcher(&self) -> Result<Launcher> {
        match &self.launcher {
            Some(launcher) => Ok(launcher.clone()),
            None => Launcher::resolve(),
        }
    }

    fn run(launcher: &Launcher, args: &[OsString]) -> Result<Output> {
        debug!("Running {}", launcher.describe(args));
        launcher.command(args).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::ToolNotFound(launcher.program.display().to_string())
            } else {
                Error::Io(e)
            }
        })
    }

    fn package(&self, launcher: &Launcher, firmware: &Path, package: &Path) -> Result<()> {
        let first = Self::run(launcher, &genpkg_args(&self.dev_type, firmware, package, false))?;
        if first.status.success() {
            return Ok(());
        }
        // Some bootloaders only accept packages that declare no SoftDevice.
        debug!("genpkg failed ({}), retrying with --sd-req 0x00", first.status);
        let second = Self::run(launcher, &genpkg_args(&self.dev_type, firmware, package, true))?;
        if second.status.success() {
            return Ok(());
        }
        Err(Error::FlashPackaging(format!(
            "{}\n{}",
            diagnostics(&first),
            diagnostics(&second)
        )))
    }

    fn upload(launcher: &Launcher, package: &Path, port: &str, baud_rate: u32) -> Result<()> {
        let output = Self::run(launcher, &serial_args(package, port, baud_rate))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::FlashUpload(diagnostics(&output)))
        }
    }
}

impl FirmwareTool for Nrfutil {
    fn flash(&self, firmware: &Path, port: Option<&str>, baud_rate: u32) -> Result<()> {
        if !firmware.is_file() {
            return Err(Error::FirmwareNotFound(firmware.to_path_buf()));
        }
        let firmware = std::path::absolute(firmware)?;
        let launcher = self.launcher()?;

        let port = match port {
            Some(p) => p.to_string(),
            None => self
                .enumerator
                .port_names()
                .into_iter()
                .next()
                .ok_or_else(|| Error::FlashUpload("No serial ports found".into()))?,
        };

        let package = package_path(&self.work_dir, &firmware);
        match std::fs::remove_file(&package) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                debug!("Could not remove stale {}: {e}", package.display());
            },
            _ => {},
        }

        info!("Packaging {}", firmware.display());
        self.package(&launcher, &firmware, &package)?;
        info!("Uploading {} to {port} @ {baud_rate}", package.display());
        Self::upload(&launcher, &package, &port, baud_rate)
    }
}
