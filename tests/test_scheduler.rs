mod common;
use common::*;

use samil_bridge::pvoutput::ChannelData;
use samil_bridge::scheduler::Scheduler;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn scheduler_config(device: &UdpSocket, listen_port: u16) -> ConfigWrapper {
    ConfigWrapper::from_config(Config {
        discovery: config::Discovery {
            interface_ip: Some(Ipv4Addr::LOCALHOST),
            broadcast_ip: Some(Ipv4Addr::LOCALHOST),
            advertisement_port: Some(device.local_addr().unwrap().port()),
            listen_port: Some(listen_port),
            accept_timeout_ms: Some(200),
            warn_after: Some(100),
        },
        inverter: config::Inverter {
            count: Some(2),
            keep_alive: Some(Duration::from_secs(60)),
            ..Default::default()
        },
        scheduler: config::Scheduler {
            interval_secs: Some(1),
        },
        loglevel: "info".to_string(),
        ..Default::default()
    })
}

// answers model info and one values request, then hangs up
async fn short_lived_inverter(mut stream: TcpStream) {
    let mut request = [0u8; 21];
    for response in [Factory::model_info_response(), Factory::values_response()] {
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(&response).await.unwrap();
    }
}

async fn next_power(receiver: &mut broadcast::Receiver<ChannelData>) -> u32 {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await {
            Ok(Ok(ChannelData::Status(status))) => return status.power_generation,
            Ok(Ok(_)) => continue,
            other => panic!("no status published: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keeps_polling_while_an_inverter_is_missing() {
    common_setup();

    let device_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listen_port = free_port();
    let channels = Channels::new();
    let mut statuses = channels.to_pvoutput.subscribe();
    let scheduler = Scheduler::new(scheduler_config(&device_udp, listen_port), channels.clone());

    // two inverters answer the first advertisements, later ones are ignored
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let mut devices = Vec::new();
        for index in 0..2 {
            device_udp.recv_from(&mut buf).await.unwrap();
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, listen_port))
                .await
                .unwrap();
            if index == 0 {
                devices.push(Device::spawn(stream, Duration::ZERO, Factory::answering()));
            } else {
                tokio::spawn(short_lived_inverter(stream));
            }
        }
        loop {
            device_udp.recv_from(&mut buf).await.unwrap();
        }
    });

    let task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.start().await })
    };

    assert_eq!(next_power(&mut statuses).await, 800);
    assert_eq!(next_power(&mut statuses).await, 400);
    assert_eq!(next_power(&mut statuses).await, 400);

    scheduler.stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
