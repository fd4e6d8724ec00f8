//! Port selection for the Master and Target roles.
//!
//! A role's device comes from, in order: the command line (or its environment
//! variable), the configuration files, the remembered selection, and finally
//! an interactive prompt. Non-interactive runs never prompt.

use {
    crate::CliError,
    anyhow::Result,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    rigctl::{DetectedPort, PortEnumerator, Role, detect_ports, device_from_label},
    std::io::IsTerminal,
};

/// Where a role's device can come from.
#[derive(Debug, Clone, Default)]
pub struct PortSources<'a> {
    /// `--master` / `--target` or the matching environment variable.
    pub cli: Option<&'a str>,
    /// Merged configuration files.
    pub config: Option<&'a str>,
    /// Selection remembered from a previous run.
    pub remembered: Option<&'a str>,
}

impl<'a> PortSources<'a> {
    /// First configured value, highest priority first.
    pub fn first(&self) -> Option<&'a str> {
        self.cli.or(self.config).or(self.remembered)
    }
}

fn usage_err(message: String) -> anyhow::Error {
    CliError::Usage(message).into()
}

/// Normalise a configured value that may be a selector label ("COM5 (nRF52)").
pub fn normalize_device(role: Role, value: &str) -> Result<String> {
    device_from_label(value).ok_or_else(|| usage_err(format!("Invalid {role} port: {value:?}")))
}

/// Resolve the device for `role`.
pub fn select_role_port(
    role: Role,
    sources: &PortSources<'_>,
    non_interactive: bool,
    enumerator: &dyn PortEnumerator,
) -> Result<String> {
    if let Some(value) = sources.first() {
        let device = normalize_device(role, value)?;
        debug!("Using {device} for {role}");
        return Ok(device);
    }

    if non_interactive {
        return Err(usage_err(format!(
            "No {role} port selected; pass --{role} or set RIGCTL_{}",
            role.as_str().to_uppercase()
        )));
    }

    let ports = detect_ports(enumerator);
    if ports.is_empty() {
        return Err(usage_err("No serial ports found".to_string()));
    }
    ensure_interactive_terminal()?;
    let port = select_port_interactive(role, ports)?;
    info!("Selected {} for {role}", port.name());
    Ok(port.name().to_string())
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --master/--target".to_string(),
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("Port prompt failed: {io_err}")).into()
            }
        },
    }
}

fn select_port_interactive(role: Role, ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| {
            let label = if p.device.is_known() {
                format!("{} [{}]", p.label(), p.device.name())
            } else {
                p.label()
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Select the {role} port"))
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}
