use std::path::Path;

use crate::app::config::ToolSettings;
use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Adb,
    Fastboot,
    MtkClient,
}

impl ToolKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "adb" => Some(Self::Adb),
            "fastboot" => Some(Self::Fastboot),
            "mtk" | "mtkclient" => Some(Self::MtkClient),
            _ => None,
        }
    }

    fn default_program(self) -> &'static str {
        match self {
            Self::Adb => "adb",
            Self::Fastboot => "fastboot",
            Self::MtkClient => "mtk",
        }
    }
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Empty config values fall back to the bare name, resolved on PATH at spawn.
pub fn resolve_program(config_command_path: &str, default_name: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        default_name.to_string()
    } else {
        normalized
    }
}

/// Bare names are left to the OS search path; anything with a separator must exist.
pub fn validate_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("Command is empty".to_string());
    }
    if !program.contains(['/', '\\']) {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("Command path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("Executable not found at the configured path".to_string());
    }
    Ok(())
}

fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Program prefixes for each external tool, resolved from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub adb: String,
    pub fastboot: String,
    /// `[python, script]` for a script checkout, `[binary]` otherwise.
    pub mtk_client: Vec<String>,
}

impl ToolPaths {
    pub fn from_settings(settings: &ToolSettings) -> Self {
        let mtk = resolve_program(&settings.mtk_client_path, ToolKind::MtkClient.default_program());
        let mtk_client = if mtk.to_lowercase().ends_with(".py") {
            vec![resolve_program(&settings.python_path, default_python()), mtk]
        } else {
            vec![mtk]
        };
        Self {
            adb: resolve_program(&settings.adb_path, ToolKind::Adb.default_program()),
            fastboot: resolve_program(
                &settings.fastboot_path,
                ToolKind::Fastboot.default_program(),
            ),
            mtk_client,
        }
    }

    fn prefix(&self, kind: ToolKind) -> Vec<String> {
        match kind {
            ToolKind::Adb => vec![self.adb.clone()],
            ToolKind::Fastboot => vec![self.fastboot.clone()],
            ToolKind::MtkClient => self.mtk_client.clone(),
        }
    }

    /// Literal argv for `kind`; arguments are never joined into a shell string.
    pub fn argv<I, S>(&self, kind: ToolKind, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.prefix(kind);
        argv.extend(args.into_iter().map(Into::into));
        argv
    }

    pub fn validate(&self, kind: ToolKind, trace_id: &str) -> Result<(), AppError> {
        for program in self.prefix(kind) {
            validate_program(&program).map_err(|err| AppError::dependency(err, trace_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_double_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn resolves_empty_to_default_name() {
        assert_eq!(resolve_program("", "fastboot"), "fastboot");
        assert_eq!(resolve_program("   ", "adb"), "adb");
        assert_eq!(resolve_program("'/x/adb'", "adb"), "/x/adb");
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
        assert!(validate_program("adb").is_ok());
        assert!(validate_program(" ").is_err());
    }

    #[test]
    fn builds_literal_argv_per_tool() {
        let settings = ToolSettings {
            adb_path: String::new(),
            fastboot_path: "/opt/fastboot".to_string(),
            python_path: "/usr/bin/python3".to_string(),
            mtk_client_path: "/opt/mtkclient/mtk.py".to_string(),
        };
        let tools = ToolPaths::from_settings(&settings);
        assert_eq!(tools.argv(ToolKind::Adb, ["reboot"]), vec!["adb", "reboot"]);
        assert_eq!(
            tools.argv(ToolKind::Fastboot, ["flash", "boot", "my boot.img"]),
            vec!["/opt/fastboot", "flash", "boot", "my boot.img"]
        );
        assert_eq!(
            tools.argv(ToolKind::MtkClient, ["gpt"]),
            vec!["/usr/bin/python3", "/opt/mtkclient/mtk.py", "gpt"]
        );
    }

    #[test]
    fn parses_tool_names() {
        assert_eq!(ToolKind::parse("ADB"), Some(ToolKind::Adb));
        assert_eq!(ToolKind::parse("mtkclient"), Some(ToolKind::MtkClient));
        assert_eq!(ToolKind::parse("odin"), None);
    }
}
