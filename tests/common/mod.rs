#![allow(dead_code)]

pub use samil_bridge::prelude::*;
pub use samil_bridge::samil::frame::{Frame, MessageId, Request, VALUES_RESPONSE_ID};
pub use samil_bridge::samil::{Error, Inverter, SessionOptions};

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One request seen by a [`Device`], with the time the answer started.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub request: Vec<u8>,
    pub received: Instant,
    pub answered: Option<Instant>,
}

/// Answers the n-th request (counting from 0) with any number of raw frames.
pub type Handler = Box<dyn FnMut(usize, &[u8]) -> Vec<Bytes> + Send>;

/// Plays the inverter side of a connection.
///
/// Requests are read as soon as they arrive, independent of answering, so
/// the log shows whether a client sent a request while one was in flight.
#[derive(Clone, Default)]
pub struct Device {
    log: Arc<Mutex<Vec<Exchange>>>,
}

impl Device {
    pub fn spawn<S>(stream: S, delay: Duration, mut handler: Handler) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let device = Self::default();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<usize>();

        let log = device.log.clone();
        tokio::spawn(async move {
            loop {
                let mut buf = [0u8; 21];
                if reader.read_exact(&mut buf).await.is_err() {
                    break;
                }
                let index = {
                    let mut log = log.lock().unwrap();
                    log.push(Exchange {
                        request: buf.to_vec(),
                        received: Instant::now(),
                        answered: None,
                    });
                    log.len() - 1
                };
                if tx.send(index).is_err() {
                    break;
                }
            }
        });

        let log = device.log.clone();
        tokio::spawn(async move {
            while let Some(index) = rx.recv().await {
                tokio::time::sleep(delay).await;
                let request = {
                    let mut log = log.lock().unwrap();
                    log[index].answered = Some(Instant::now());
                    log[index].request.clone()
                };
                for frame in handler(index, &request) {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
        });

        device
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

pub struct Factory;

impl Factory {
    pub fn addr() -> SocketAddr {
        "192.168.1.20:40123".parse().unwrap()
    }

    pub fn options(keep_alive: Duration) -> SessionOptions {
        SessionOptions {
            keep_alive,
            response_timeout: None,
        }
    }

    /// Values payload of an inverter producing 400 W, padded to 64 bytes
    /// like real devices send.
    pub fn values_payload() -> Vec<u8> {
        let mut p = vec![0u8; 64];
        p[0..2].copy_from_slice(&200u16.to_be_bytes()); // ambient 20.0
        p[2..4].copy_from_slice(&3605u16.to_be_bytes()); // pv1 360.5 V
        p[6..8].copy_from_slice(&12u16.to_be_bytes()); // pv1 1.2 A
        p[14..16].copy_from_slice(&385u16.to_be_bytes()); // inverter 38.5
        p[18..20].copy_from_slice(&2301u16.to_be_bytes()); // grid 230.1 V
        p[20..22].copy_from_slice(&5002u16.to_be_bytes()); // 50.02 Hz
        p[22..24].copy_from_slice(&17u16.to_be_bytes()); // 1.7 A
        p[34..38].copy_from_slice(&123456u32.to_be_bytes()); // 12345.6 kWh
        p[38..42].copy_from_slice(&4321u32.to_be_bytes()); // hours
        p[42..44].copy_from_slice(&1234u16.to_be_bytes()); // 12.34 kWh
        p[44..48].copy_from_slice(&0x190u32.to_be_bytes()); // 400 W
        p[48..50].copy_from_slice(&1u16.to_be_bytes()); // normal
        p
    }

    pub fn values_response() -> Bytes {
        Frame::build(VALUES_RESPONSE_ID, &Self::values_payload()).unwrap()
    }

    pub fn model_info_response() -> Bytes {
        Frame::build(MessageId([0x00, 0x01, 0x80]), b"SolarRiver 4500TL-D").unwrap()
    }

    /// Answers values requests with values and model info requests with
    /// model info.
    pub fn answering() -> Handler {
        Box::new(|_, request| {
            if request == Request::ModelInfo.bytes() {
                vec![Self::model_info_response()]
            } else {
                vec![Self::values_response()]
            }
        })
    }

    pub fn silent() -> Handler {
        Box::new(|_, _| Vec::new())
    }

    /// An inverter session talking to a [`Device`] over an in-memory pipe.
    pub fn session(options: SessionOptions, delay: Duration, handler: Handler) -> (Inverter<DuplexStream>, Device) {
        let (client, server) = tokio::io::duplex(4096);
        let device = Device::spawn(server, delay, handler);
        (Inverter::new(client, Self::addr(), options), device)
    }
}
