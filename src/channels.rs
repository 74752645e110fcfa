use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_scheduler: broadcast::Sender<scheduler::ChannelData>,
    pub to_pvoutput: broadcast::Sender<pvoutput::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_scheduler: Self::channel(),
            to_pvoutput: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(64).0
    }
}
