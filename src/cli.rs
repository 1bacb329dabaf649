use crate::config::RuntimeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    scripts: Option<PathBuf>,
    frames: Option<u64>,
    dt: Option<f32>,
    debug_symbols: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "scripts" => overrides.scripts = Some(PathBuf::from(value)),
                "frames" => {
                    overrides.frames =
                        Some(value.parse::<u64>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "dt" => {
                    let dt = value.parse::<f32>().with_context(|| format!("Invalid timestep '{value}'"))?;
                    if !(dt > 0.0 && dt.is_finite()) {
                        bail!("Timestep must be a positive number of seconds, got '{value}'");
                    }
                    overrides.dt = Some(dt);
                }
                "debug-symbols" => overrides.debug_symbols = Some(parse_bool_flag("debug-symbols", &value)?),
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --scripts, --frames, --dt, --debug-symbols."
                ),
            }
        }
        Ok(overrides)
    }

    /// Config file to load before applying the other overrides.
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn into_config_overrides(self) -> RuntimeConfigOverrides {
        RuntimeConfigOverrides {
            scripts_root: self.scripts,
            frames: self.frames,
            fixed_dt: self.dt,
            debug_symbols: self.debug_symbols,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_flags() {
        let args = ["app", "--config", "cfg.json", "--scripts", "behaviours", "--frames", "30", "--dt", "0.5"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.config_path(), Some(&PathBuf::from("cfg.json")));
        let cfg = overrides.into_config_overrides();
        assert_eq!(cfg.scripts_root, Some(PathBuf::from("behaviours")));
        assert_eq!(cfg.frames, Some(30));
        assert_eq!(cfg.fixed_dt, Some(0.5));
        assert_eq!(cfg.debug_symbols, None);
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["app", "--frames", "1", "--frames", "9", "--debug-symbols", "on", "--debug-symbols", "off"];
        let cfg = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(cfg.frames, Some(9));
        assert_eq!(cfg.debug_symbols, Some(false));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["app", "--frames"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags_and_bad_timesteps() {
        let err = CliOverrides::parse(["app", "--width", "800"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
        let err = CliOverrides::parse(["app", "--dt", "-1"]).unwrap_err();
        assert!(err.to_string().contains("positive"), "{err}");
    }
}
