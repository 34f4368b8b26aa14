//! Launch command for the tunnel server sidecar.

use crate::error::CommandError;
use crate::process::ProcessCommand;

/// Runs `devicelab-tunneld` (or a compatible program) on a local port.
///
/// Produces `[program, <port>, --log-level <level>, --, <provider...>]`,
/// omitting the parts that are not set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelServerCommand {
    program: String,
    port: u16,
    log_level: Option<String>,
    provider: Vec<String>,
}

impl TunnelServerCommand {
    pub fn new(program: impl Into<String>, port: u16) -> Result<Self, CommandError> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(CommandError::MissingArgument("program"));
        }
        if port == 0 {
            return Err(CommandError::InvalidArgument(
                "tunnel server port must be non-zero".into(),
            ));
        }
        Ok(Self {
            program,
            port,
            log_level: None,
            provider: Vec::new(),
        })
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Command the server runs per device to bring a tunnel up.
    pub fn provider(mut self, provider: Vec<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ProcessCommand for TunnelServerCommand {
    fn parse(&self) -> Vec<String> {
        let mut args = vec![self.program.clone(), self.port.to_string()];
        if let Some(level) = &self.log_level {
            args.push("--log-level".into());
            args.push(level.clone());
        }
        if !self.provider.is_empty() {
            args.push("--".into());
            args.extend(self.provider.iter().cloned());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cmd = TunnelServerCommand::new("devicelab-tunneld", 49151).unwrap();
        assert_eq!(cmd.parse(), vec!["devicelab-tunneld", "49151"]);
    }

    #[test]
    fn test_parse_with_log_level_and_provider() {
        let cmd = TunnelServerCommand::new("devicelab-tunneld", 5000)
            .unwrap()
            .log_level("debug")
            .provider(vec!["tunnel-up".into(), "{udid}".into()]);
        assert_eq!(
            cmd.parse(),
            vec![
                "devicelab-tunneld",
                "5000",
                "--log-level",
                "debug",
                "--",
                "tunnel-up",
                "{udid}"
            ]
        );
    }

    #[test]
    fn test_parse_is_repeatable() {
        let cmd = TunnelServerCommand::new("tunneld", 1).unwrap().log_level("info");
        assert_eq!(cmd.parse(), cmd.parse());
    }

    #[test]
    fn test_rejects_zero_port() {
        assert!(TunnelServerCommand::new("tunneld", 0).is_err());
    }

    #[test]
    fn test_rejects_empty_program() {
        assert!(matches!(
            TunnelServerCommand::new("  ", 49151),
            Err(CommandError::MissingArgument("program"))
        ));
    }
}
