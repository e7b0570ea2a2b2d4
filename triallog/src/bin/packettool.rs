//! Synthesizes valid trial-logger traffic and sends it over UDP.
//!
//! Stands in for a sensor bridge: it announces metadata, advances trials,
//! and streams an analog group with a slowly wandering signal, all in the
//! daemon's wire format. Useful for smoke-testing a running logger without
//! real acquisition hardware.

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;

use triallog_wire::{
    frame, ElementType, GroupHeader, GroupKind, GroupPacket, SignalKind, SignalSample,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Send synthetic trial-logger traffic", long_about = None)]
struct Args {
    /// Destination HOST:PORT of a running logger
    #[clap(long, default_value = "127.0.0.1:29001")]
    target: String,

    /// Trials to send
    #[clap(long, default_value_t = 3)]
    trials: u32,

    /// Data packets per trial
    #[clap(long, default_value_t = 20)]
    packets_per_trial: u32,

    /// Milliseconds between data packets
    #[clap(long, default_value_t = 10)]
    interval_ms: u64,

    /// Subject name announced before the first trial
    #[clap(long, default_value = "alpha")]
    subject: String,

    /// Seed for the synthetic signal
    #[clap(long, default_value_t = 0)]
    seed: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] triallog_wire::Error),
}

fn control_packet(signal: &str, element_type: ElementType, data: Vec<u8>) -> GroupPacket {
    GroupPacket {
        header: GroupHeader {
            version: 1,
            name: "control".to_owned(),
            kind: GroupKind::Control,
            config_hash: 0,
            n_signals: 1,
        },
        signals: vec![SignalSample {
            is_variable: false,
            concat_last_dim: false,
            kind: SignalKind::Param,
            concat_dimension: 0,
            name: signal.to_owned(),
            units: String::new(),
            element_type,
            dims: vec![(data.len() / element_type.width()) as u16],
            timestamp: 0.0,
            data,
        }],
    }
}

fn next_trial(id: u32) -> GroupPacket {
    control_packet("next_trial", ElementType::U32, id.to_le_bytes().to_vec())
}

fn analog_packet(timestamp_ms: f64, level: &mut f32, rng: &mut SmallRng) -> GroupPacket {
    let samples: Vec<f32> = (0..4)
        .map(|_| {
            *level += rng.gen_range(-0.25..0.25);
            *level
        })
        .collect();
    GroupPacket {
        header: GroupHeader {
            version: 1,
            name: "synthetic_analog".to_owned(),
            kind: GroupKind::Analog,
            config_hash: 0x5eed_0001,
            n_signals: 1,
        },
        signals: vec![SignalSample {
            is_variable: false,
            concat_last_dim: false,
            kind: SignalKind::Analog,
            concat_dimension: 0,
            name: "level".to_owned(),
            units: "mV".to_owned(),
            element_type: ElementType::F32,
            dims: vec![4],
            timestamp: timestamp_ms,
            data: samples.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }],
    }
}

fn send(socket: &UdpSocket, target: &str, packet: &GroupPacket) -> Result<(), Error> {
    let datagram = frame::frame(&packet.encode()?)?;
    socket.send_to(&datagram, target)?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_ansi(false).finish().init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut level = 0.0f32;

    info!(target = %args.target, subject = %args.subject, "announcing metadata");
    send(
        &socket,
        &args.target,
        &control_packet("subject", ElementType::Char, args.subject.into_bytes()),
    )?;

    let mut timestamp_ms = 0.0;
    for trial in 1..=args.trials {
        info!(trial, "advancing");
        send(&socket, &args.target, &next_trial(trial))?;
        for _ in 0..args.packets_per_trial {
            send(
                &socket,
                &args.target,
                &analog_packet(timestamp_ms, &mut level, &mut rng),
            )?;
            timestamp_ms += args.interval_ms as f64;
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }
    // One more advance completes the final trial.
    send(&socket, &args.target, &next_trial(args.trials + 1))?;
    info!(trials = args.trials, "done");

    Ok(())
}
