//! CLI and environment configuration, parsed before self-relocation while
//! `std` is still fully available.
//!
//! Parsed by hand rather than pulling in a CLI-parsing crate, since the
//! whole surface is a handful of flags and one or more positional paths.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--{flag} requires an argument")]
    MissingArg { flag: &'static str },
    #[error("--mtcp-restart-pause requires a single digit '0'-'9', got {0:?}")]
    BadPauseDigit(String),
    #[error("unrecognized argument: {0}")]
    Unrecognized(String),
    #[error("an image path and --fd are mutually exclusive")]
    ImageAndFd,
    #[error("exactly one of an image path or --fd must be given (unless --mpi)")]
    NoImageSource,
    #[error("{USAGE}")]
    HelpRequested,
}

const USAGE: &str = "usage: mtcp-restart [--fd N | --stderr-fd N | --mtcp-restart-pause D \
| --simulate | --use-gdb | --mpi IMAGE...] [IMAGE]";

/// Where the restorer reads pause-level overrides from when neither CLI
/// flag nor a positional default applies.
const ENV_RESTART_PAUSE: &str = "DMTCP_RESTART_PAUSE";
/// Nonzero: skip self-relocation entirely, for running under a debugger.
const ENV_DEBUG_SKIP_RELOCATE: &str = "DMTCP_DEBUG_MTCP_RESTART";
/// Nonzero: emit extra diagnostics during region restoration.
const ENV_VERBOSE: &str = "MTCP_RESTART_VERBOSE";

#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub image_path: Option<PathBuf>,
    pub fd: Option<i32>,
    pub stderr_fd: Option<i32>,
    pub restart_pause: Option<u8>,
    pub simulate: bool,
    pub use_gdb: bool,
    pub mpi: bool,
    pub mpi_images: Vec<PathBuf>,
    pub debug_skip_relocate: bool,
    pub verbose: bool,
}

impl RestartConfig {
    /// Parse `argv[1..]`. Environment variables are consulted for values
    /// the CLI didn't set; an explicit flag always overrides the
    /// environment.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<RestartConfig, ConfigError> {
        let mut image_path = None;
        let mut fd = None;
        let mut stderr_fd = None;
        let mut restart_pause = None;
        let mut simulate = false;
        let mut use_gdb = false;
        let mut mpi = false;
        let mut mpi_images = Vec::new();

        let mut iter = args.into_iter().peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(ConfigError::HelpRequested),
                "--fd" => {
                    let v = iter.next().ok_or(ConfigError::MissingArg { flag: "fd" })?;
                    fd = Some(v.parse::<i32>().map_err(|_| ConfigError::MissingArg { flag: "fd" })?);
                }
                "--stderr-fd" => {
                    let v = iter
                        .next()
                        .ok_or(ConfigError::MissingArg { flag: "stderr-fd" })?;
                    stderr_fd = Some(
                        v.parse::<i32>()
                            .map_err(|_| ConfigError::MissingArg { flag: "stderr-fd" })?,
                    );
                }
                "--mtcp-restart-pause" => {
                    let v = iter
                        .next()
                        .ok_or(ConfigError::MissingArg { flag: "mtcp-restart-pause" })?;
                    if v.len() != 1 || !v.as_bytes()[0].is_ascii_digit() {
                        return Err(ConfigError::BadPauseDigit(v));
                    }
                    restart_pause = Some(v.as_bytes()[0] - b'0');
                }
                "--simulate" => simulate = true,
                "--use-gdb" => use_gdb = true,
                "--mpi" => {
                    mpi = true;
                    // Every remaining argument is an image path handed to
                    // the plugin hook, not parsed further by the core.
                    for rest in iter.by_ref() {
                        mpi_images.push(PathBuf::from(rest));
                    }
                }
                other if other.starts_with("--") => return Err(ConfigError::Unrecognized(other.to_string())),
                positional => {
                    if image_path.is_some() {
                        return Err(ConfigError::Unrecognized(positional.to_string()));
                    }
                    image_path = Some(PathBuf::from(positional));
                }
            }
        }

        if !mpi {
            match (&image_path, fd) {
                (Some(_), Some(_)) => return Err(ConfigError::ImageAndFd),
                (None, None) => return Err(ConfigError::NoImageSource),
                _ => {}
            }
        }

        let restart_pause = restart_pause.or_else(|| {
            std::env::var(ENV_RESTART_PAUSE)
                .ok()
                .and_then(|v| v.parse::<u8>().ok())
        });

        let debug_skip_relocate = std::env::var(ENV_DEBUG_SKIP_RELOCATE)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v != 0)
            .unwrap_or(false);

        let verbose = mtcp_sys::env::getenv(ENV_VERBOSE)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v != 0)
            .unwrap_or(false);

        Ok(RestartConfig {
            image_path,
            fd,
            stderr_fd,
            restart_pause,
            simulate,
            use_gdb,
            mpi,
            mpi_images,
            debug_skip_relocate,
            verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_plain_image_path() {
        let cfg = RestartConfig::parse(args(&["/tmp/ckpt.img"])).unwrap();
        assert_eq!(cfg.image_path, Some(PathBuf::from("/tmp/ckpt.img")));
        assert_eq!(cfg.fd, None);
    }

    #[test]
    fn rejects_image_and_fd_together() {
        let err = RestartConfig::parse(args(&["/tmp/ckpt.img", "--fd", "5"])).unwrap_err();
        assert!(matches!(err, ConfigError::ImageAndFd));
    }

    #[test]
    fn requires_a_source_without_mpi() {
        let err = RestartConfig::parse(args(&["--simulate"])).unwrap_err();
        assert!(matches!(err, ConfigError::NoImageSource));
    }

    #[test]
    fn mpi_consumes_remaining_args_as_images() {
        let cfg = RestartConfig::parse(args(&["--mpi", "a.img", "b.img"])).unwrap();
        assert!(cfg.mpi);
        assert_eq!(cfg.mpi_images, vec![PathBuf::from("a.img"), PathBuf::from("b.img")]);
        assert_eq!(cfg.image_path, None);
    }

    #[test]
    fn rejects_bad_pause_digit() {
        let err = RestartConfig::parse(args(&["img", "--mtcp-restart-pause", "10"])).unwrap_err();
        assert!(matches!(err, ConfigError::BadPauseDigit(_)));
    }

    #[test]
    fn help_flag_short_circuits_everything_else() {
        let err = RestartConfig::parse(args(&["--help"])).unwrap_err();
        assert!(matches!(err, ConfigError::HelpRequested));
        let err = RestartConfig::parse(args(&["-h", "img", "--fd", "5"])).unwrap_err();
        assert!(matches!(err, ConfigError::HelpRequested));
    }
}
