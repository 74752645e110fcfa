use crate::prelude::*;
use crate::pvoutput::{Output, Status};

use chrono::NaiveDate;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelData {
    Shutdown,
}

// energy generated so far on the day of the last status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Day {
    date: NaiveDate,
    generated: u64,
}

/// Polls every connected inverter on a fixed interval and publishes the
/// combined values for upload.
#[derive(Clone)]
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let mut listener =
            InverterListener::bind(self.config.discovery().clone(), self.config.inverter()).await?;

        let stopped = CancellationToken::new();
        let watcher = self.watch_shutdown(listener.handle(), stopped.clone());

        let mut inverters = Vec::new();
        let mut day = None;
        let mut interval = tokio::time::interval(self.config.scheduler().interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = self.tick(&mut listener, &mut inverters, &mut day) => {}
            }
        }

        for inverter in inverters {
            if let Err(e) = inverter.close().await {
                warn!("inverter {}: error while closing: {}", inverter, e);
            }
        }
        watcher.abort();

        info!("scheduler exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_scheduler.send(ChannelData::Shutdown);
    }

    // Live sessions are polled before any missing inverter is searched for.
    // The search only blocks the tick while nothing else is connected.
    async fn tick(
        &self,
        listener: &mut InverterListener,
        inverters: &mut Vec<samil::Inverter<TcpStream>>,
        day: &mut Option<Day>,
    ) {
        if inverters.is_empty() {
            if let Err(e) = self.connect_missing(listener, inverters).await {
                error!("inverter search failed: {}", e);
                return;
            }
        }

        if let Some(reading) = self.poll(inverters).await {
            self.publish(&reading, day);
        }

        if inverters.len() < self.config.inverter().count() {
            let limit = self.config.discovery().accept_timeout();
            match tokio::time::timeout(limit, self.connect_missing(listener, inverters)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("inverter search failed: {}", e),
                Err(_) => info!(
                    "{} of {} inverters connected, searching again next tick",
                    inverters.len(),
                    self.config.inverter().count()
                ),
            }
        }
    }

    fn publish(&self, reading: &Reading, day: &mut Option<Day>) {
        let status = Status::from_reading(reading, chrono::Local::now().naive_local());
        if let Some(output) = Self::roll_day(day, &status) {
            info!("day {} finished with {} Wh", output.date, output.generated);
            let _ = self.channels.to_pvoutput.send(pvoutput::ChannelData::Output(output));
        }

        info!(
            "output {} W, today {} Wh, grid {:.1} V",
            status.power_generation, status.energy_generation, status.voltage
        );
        if let Err(e) = self.channels.to_pvoutput.send(pvoutput::ChannelData::Status(status)) {
            debug!("no uploader listening: {}", e);
        }
    }

    // sessions that fail fatally are dropped and rediscovered on the next tick
    async fn poll(&self, inverters: &mut Vec<samil::Inverter<TcpStream>>) -> Option<Reading> {
        let mut readings = Vec::with_capacity(inverters.len());
        let mut alive = Vec::with_capacity(inverters.len());

        for inverter in inverters.drain(..) {
            match inverter.request_values().await {
                Ok(reading) => {
                    if self.config.strict_data_check() {
                        if let Err(e) = reading.validate() {
                            warn!("inverter {}: discarding reading: {}", inverter, e);
                            alive.push(inverter);
                            continue;
                        }
                    }
                    readings.push(reading);
                    alive.push(inverter);
                }
                Err(e) if e.is_fatal() => {
                    error!("inverter {}: {}, dropping session", inverter, e);
                    let _ = inverter.close().await;
                }
                Err(e) => {
                    warn!("inverter {}: {}", inverter, e);
                    alive.push(inverter);
                }
            }
        }

        *inverters = alive;
        Reading::aggregate(&readings)
    }

    fn roll_day(day: &mut Option<Day>, status: &Status) -> Option<Output> {
        let today = Day {
            date: status.time.date(),
            generated: status.energy_generation,
        };

        match day.replace(today) {
            Some(previous) if previous.date != today.date => Some(Output {
                date: previous.date,
                generated: previous.generated,
            }),
            _ => None,
        }
    }

    fn watch_shutdown(&self, listener: samil::ListenerHandle, stopped: CancellationToken) -> JoinHandle<()> {
        let mut receiver = self.channels.to_scheduler.subscribe();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            info!("scheduler received shutdown signal");
            stopped.cancel();
            listener.close();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn status(time: &str, generated: u64) -> Status {
        Status {
            time: NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M").unwrap(),
            energy_generation: generated,
            power_generation: 0,
            temperature: 20.0,
            voltage: 230.0,
        }
    }

    #[test]
    fn roll_day_reports_previous_day() {
        let mut day = None;
        assert_eq!(Scheduler::roll_day(&mut day, &status("2024-06-01 21:55", 12000)), None);
        assert_eq!(Scheduler::roll_day(&mut day, &status("2024-06-01 22:00", 12100)), None);
        assert_eq!(
            Scheduler::roll_day(&mut day, &status("2024-06-02 05:30", 0)),
            Some(Output {
                date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                generated: 12100,
            })
        );
        assert_eq!(Scheduler::roll_day(&mut day, &status("2024-06-02 05:35", 10)), None);
    }
}
