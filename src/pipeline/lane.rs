//! Named groups of antenna ports sharing a notification channel
//!
//! A 4-port reader can serve two shipping lanes at once, each with its own
//! downstream channel and the option to start reading on one lane only.

use crate::pipeline::direction::parse_port_range;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, PartialEq)]
pub struct Lane {
    pub name: String,
    pub ports: RangeInclusive<u16>,
    /// Notification channel; defaults to the lane name
    pub channel: String,
}

impl Lane {
    pub fn new(name: impl Into<String>, ports: RangeInclusive<u16>) -> Self {
        let name = name.into();
        Self {
            channel: name.clone(),
            name,
            ports,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn covers(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Parse `"Carril2=1-2,Carril3=3-4"`
///
/// An optional `@channel` suffix overrides the channel name:
/// `"Carril2=1-2@Embarque-Carril-2"`.
pub fn parse_lanes(raw: &str) -> Result<Vec<Lane>, String> {
    let mut lanes: Vec<Lane> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| format!("lane entry '{}' must be NAME=RANGE", entry))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("lane entry '{}' has no name", entry));
        }

        let (range, channel) = match rest.split_once('@') {
            Some((range, channel)) => (range, Some(channel.trim())),
            None => (rest, None),
        };

        let mut lane = Lane::new(name, parse_port_range(range)?);
        if let Some(channel) = channel.filter(|c| !c.is_empty()) {
            lane = lane.with_channel(channel);
        }

        if lanes.iter().any(|l| l.name == lane.name) {
            return Err(format!("lane '{}' defined twice", lane.name));
        }
        lanes.push(lane);
    }

    Ok(lanes)
}

/// First lane covering `port`
pub fn lane_for(lanes: &[Lane], port: u16) -> Option<&Lane> {
    lanes.iter().find(|l| l.covers(port))
}
