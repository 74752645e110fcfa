pub use crate::{
    channels::Channels,
    config::{self, Config, ConfigWrapper},
    file_error,
    options::Options,
    pvoutput, samil,
    samil::{InverterListener, Reading},
    scheduler,
    utils::Utils,
};

pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::broadcast;
