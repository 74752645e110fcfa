use clap::Parser;

/// Samil Bridge - reads Samil Power inverters and uploads to PVOutput
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Connect to one inverter, print its model info and current values, then exit
    #[clap(long = "probe")]
    pub probe: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
