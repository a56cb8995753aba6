use apkbrand_request::PackageName;
use clap::builder::TypedValueParser;
use clap::error::ErrorKind;
use clap::{Error, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Clone)]
struct PackageNameParser;

impl TypedValueParser for PackageNameParser {
    type Value = PackageName;

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> Result<Self::Value, clap::Error> {
        let value = value
            .to_str()
            .ok_or_else(|| Error::raw(ErrorKind::InvalidUtf8, "Invalid UTF-8 in package name"))?;

        PackageName::new(value).map_err(|err| Error::raw(ErrorKind::InvalidValue, format!("{err}\n")))
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Rebrand, re-sign and publish the base APK")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build one rebranded APK
    Build {
        /// Display name shown under the launcher icon
        #[arg(short, long)]
        name: String,

        /// New application id, e.g. com.acme.app
        #[arg(short, long, value_parser = PackageNameParser)]
        package: Option<PackageName>,

        /// Logo to download
        #[arg(long, conflicts_with = "logo_file")]
        logo_url: Option<String>,

        /// Local logo image
        #[arg(long)]
        logo_file: Option<PathBuf>,

        #[arg(long)]
        user_id: String,

        #[arg(long)]
        token: String,

        /// Reuse a caller-chosen build id instead of generating one
        #[arg(long)]
        build_id: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every request of a JSON array concurrently
    Batch {
        requests: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Check that the external tools can be found
    Check,

    /// Delete published artifacts older than the retention window
    Sweep,
}
