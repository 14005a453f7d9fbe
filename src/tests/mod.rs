#![allow(unused_imports)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::*;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::LevelFilter;
use simple_logger::SimpleLogger;

use super::config::HomaConfig;
use super::error::HomaError;
use super::sock::RecvFlags;
use super::transport::Homa;
use super::type_alias::*;
use super::wire::{self, CommonHeader, Packet, PktType};

pub(crate) mod mock;

mod pacing;
mod small;

pub(self) fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Warn).init();
}

pub(self) const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(self) const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub(self) const SERVER_PORT: Port = 99;

/// Poll until `cond` holds or the deadline passes; the loopback network
/// delivers on its own thread, so tests wait instead of assuming.
pub(self) fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached within deadline");
}
