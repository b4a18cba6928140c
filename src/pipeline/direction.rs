//! Direction of travel across the checkpoint from antenna-port transitions

use crate::pipeline::window::DetectionBatch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Entry,
    Exit,
    Static,
    Indeterminate,
}

impl From<Direction> for &'static str {
    fn from(dir: Direction) -> &'static str {
        match dir {
            Direction::Entry => "ENTRY",
            Direction::Exit => "EXIT",
            Direction::Static => "STATIC",
            Direction::Indeterminate => "INDETERMINATE",
        }
    }
}

/// Which side of the checkpoint a zone covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Near,
    Far,
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "near" => Some(Side::Near),
            "far" => Some(Side::Far),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    pub side: Side,
    pub ports: RangeInclusive<u16>,
}

/// Ordered port-range → zone assignments; the first matching range wins
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneMap {
    zones: Vec<Zone>,
}

impl ZoneMap {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self { zones }
    }

    pub fn split(near: RangeInclusive<u16>, far: RangeInclusive<u16>) -> Self {
        Self::new(vec![
            Zone {
                name: "near-side".to_string(),
                side: Side::Near,
                ports: near,
            },
            Zone {
                name: "far-side".to_string(),
                side: Side::Far,
                ports: far,
            },
        ])
    }

    /// 13-port dock door: 1–6 outside, 7–13 inside
    pub fn dock_door() -> Self {
        Self::split(1..=6, 7..=13)
    }

    /// 4-port shipping lane: 1–2 outside, 3–4 inside
    pub fn lane() -> Self {
        Self::split(1..=2, 3..=4)
    }

    /// Parse `"1-6:near-side:near,7-13:far-side:far"`
    ///
    /// The zone name is optional (`"1-6:near"`); single ports are written
    /// as `"5:far"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut zones = Vec::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let (range, name, side) = match parts.as_slice() {
                [range, side] => (*range, *side, *side),
                [range, name, side] => (*range, *name, *side),
                _ => return Err(format!("zone entry '{}' must be RANGE[:NAME]:SIDE", entry)),
            };

            let side = Side::parse(side)
                .ok_or_else(|| format!("zone side '{}' must be 'near' or 'far'", side))?;
            let ports = parse_port_range(range)?;

            zones.push(Zone {
                name: name.to_string(),
                side,
                ports,
            });
        }

        if zones.is_empty() {
            return Err("zone map is empty".to_string());
        }

        Ok(Self::new(zones))
    }

    pub fn zone_for(&self, port: u16) -> Option<&Zone> {
        self.zones.iter().find(|z| z.ports.contains(&port))
    }

    pub fn side_of(&self, port: u16) -> Option<Side> {
        self.zone_for(port).map(|z| z.side)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }
}

/// Parse `"3-4"` or `"7"` into an inclusive port range
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let parse = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid antenna port '{}'", p.trim()))
    };

    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let port = parse(s)?;
            (port, port)
        }
    };

    if start == 0 || start > end {
        return Err(format!("invalid port range '{}'", s));
    }
    Ok(start..=end)
}

/// Infers movement across the checkpoint from the port a tag was last seen on
///
/// Keeps the last recorded port per EPC for the lifetime of the classifier;
/// it is not cleared between batches.
pub struct DirectionClassifier {
    zones: ZoneMap,
    last_ports: Mutex<HashMap<String, u16>>,
}

impl DirectionClassifier {
    pub fn new(zones: ZoneMap) -> Self {
        Self {
            zones,
            last_ports: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, u16>> {
        self.last_ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decide(&self, prior: Option<u16>, current: u16) -> Direction {
        let Some(prior) = prior else {
            return Direction::Indeterminate;
        };

        match (self.zones.side_of(prior), self.zones.side_of(current)) {
            (Some(Side::Near), Some(Side::Far)) => Direction::Entry,
            (Some(Side::Far), Some(Side::Near)) => Direction::Exit,
            _ => Direction::Static,
        }
    }

    /// Classify one sighting, then record `current_port` for next time
    pub fn classify(&self, epc: &str, current_port: u16) -> Direction {
        let mut table = self.table();

        let prior = table.get(epc).copied();
        let direction = self.decide(prior, current_port);
        table.insert(epc.to_string(), current_port);

        direction
    }

    /// Classify every tag of a batch, in batch order
    pub fn classify_batch(&self, batch: &DetectionBatch) -> Vec<Direction> {
        batch
            .detections
            .iter()
            .map(|d| self.classify(d.epc(), d.antenna_port()))
            .collect()
    }

    pub fn last_port(&self, epc: &str) -> Option<u16> {
        self.table().get(epc).copied()
    }

    pub fn tracked(&self) -> usize {
        self.table().len()
    }

    pub fn zones(&self) -> &ZoneMap {
        &self.zones
    }
}
