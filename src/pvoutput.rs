use crate::prelude::*;

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type Params = Vec<(&'static str, String)>;

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelData {
    Status(Status),
    Output(Output),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    AddOutput,
    AddStatus,
}

impl RequestType {
    // order in which cached requests are retried
    const ALL: [RequestType; 2] = [RequestType::AddOutput, RequestType::AddStatus];

    fn path(&self) -> &'static str {
        match self {
            RequestType::AddOutput => "/service/r2/addoutput.jsp",
            RequestType::AddStatus => "/service/r2/addstatus.jsp",
        }
    }
}

// Status {{{
/// Live data for the addstatus service.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub time: NaiveDateTime,
    pub energy_generation: u64, // Wh, v1
    pub power_generation: u32,  // W, v2
    pub temperature: f64,       // °C, v5
    pub voltage: f64,           // V, v6
}

impl Status {
    pub fn from_reading(reading: &Reading, time: NaiveDateTime) -> Self {
        Self {
            time,
            energy_generation: (reading.energy_today * 1000.0).round() as u64,
            power_generation: reading.output_power,
            temperature: reading.ambient_temp,
            voltage: reading.grid_voltage,
        }
    }

    fn params(&self) -> Params {
        vec![
            ("d", self.time.format("%Y%m%d").to_string()),
            ("t", self.time.format("%H:%M").to_string()),
            ("v1", self.energy_generation.to_string()),
            ("v2", self.power_generation.to_string()),
            ("v5", format!("{:.1}", self.temperature)),
            ("v6", format!("{:.1}", self.voltage)),
        ]
    }
} // }}}

// Output {{{
/// End of day summary for the addoutput service.
#[derive(Clone, Debug, PartialEq)]
pub struct Output {
    pub date: NaiveDate,
    pub generated: u64, // Wh
}

impl Output {
    fn params(&self) -> Params {
        vec![
            ("d", self.date.format("%Y%m%d").to_string()),
            ("g", self.generated.to_string()),
        ]
    }
} // }}}

/// Uploads to PVOutput. Failed uploads are cached and retried, at most one
/// per request type, after the next successful upload.
#[derive(Clone)]
pub struct PvOutput {
    config: config::PvOutput,
    channels: Channels,
    client: reqwest::Client,
    cache: Arc<Mutex<HashMap<RequestType, VecDeque<Params>>>>,
}

impl PvOutput {
    pub fn new(config: config::PvOutput, channels: Channels) -> Self {
        Self {
            config,
            channels,
            client: reqwest::Client::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.channels.to_pvoutput.subscribe();

        info!("pvoutput uploader started for system {}", self.config.system_id());

        loop {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) => {
                    info!("pvoutput uploader received shutdown signal");
                    break;
                }
                Ok(ChannelData::Status(status)) => {
                    if let Err(e) = self.add_status(&status).await {
                        warn!("add status failed: {}", e);
                    }
                }
                Ok(ChannelData::Output(output)) => {
                    if let Err(e) = self.add_output(&output).await {
                        warn!("add output failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(e) => {
                    warn!("Error receiving from channel: {}", e);
                    continue;
                }
            }
        }

        info!("pvoutput uploader exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_pvoutput.send(ChannelData::Shutdown);
    }

    pub async fn add_status(&self, status: &Status) -> Result<()> {
        self.make_request(RequestType::AddStatus, status.params()).await
    }

    pub async fn add_output(&self, output: &Output) -> Result<()> {
        self.make_request(RequestType::AddOutput, output.params()).await
    }

    /// Number of failed uploads of the given type waiting for a retry.
    pub fn pending(&self, request_type: RequestType) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.get(&request_type).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    async fn make_request(&self, request_type: RequestType, params: Params) -> Result<()> {
        match self.send(request_type, &params).await {
            Ok(()) => {
                self.retry_failed_requests().await;
                Ok(())
            }
            Err(e) => {
                error!("Upload failed: {}", e);
                self.cache_push(request_type, params);
                Err(e)
            }
        }
    }

    async fn send(&self, request_type: RequestType, params: &Params) -> Result<()> {
        let url = format!("{}{}", self.config.url(), request_type.path());
        debug!("Making request: {}, {:?}", url, params);

        let response = self
            .client
            .post(&url)
            .header("X-Pvoutput-Apikey", self.config.api_key())
            .header("X-Pvoutput-SystemId", self.config.system_id())
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("{} {}", status, body);
        }

        debug!("Response: {}", body);
        Ok(())
    }

    // one retry per type keeps us inside the PVOutput rate limit
    async fn retry_failed_requests(&self) {
        for request_type in RequestType::ALL {
            let params = match self.cache_pop(request_type) {
                Some(params) => params,
                None => continue,
            };

            info!("Retrying cached {:?} request", request_type);
            if let Err(e) = self.send(request_type, &params).await {
                warn!("Retry of {:?} failed: {}", request_type, e);
                self.cache_restore(request_type, params);
            }
        }
    }

    fn cache_push(&self, request_type: RequestType, params: Params) {
        if let Ok(mut cache) = self.cache.lock() {
            let queue = cache.entry(request_type).or_default();
            queue.push_back(params);
            while queue.len() > self.config.cache_size() {
                warn!("{:?} cache full, dropping oldest request", request_type);
                queue.pop_front();
            }
        }
    }

    fn cache_pop(&self, request_type: RequestType) -> Option<Params> {
        self.cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get_mut(&request_type).and_then(VecDeque::pop_back))
    }

    // puts a request back where cache_pop took it from
    fn cache_restore(&self, request_type: RequestType, params: Params) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.entry(request_type).or_default().push_back(params);
        }
    }
}
