//! Global scalar simulation state, shared read-mostly by every subsystem.

use glam::Vec3;
use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::error::StateError;
use crate::fsutil::write_atomic;
use crate::group::ProcessGroup;

/// File name of the scalar state record inside a checkpoint folder.
pub const STATE_FILE_NAME: &str = "state.mflow";

const RECORD_FIELDS: usize = 12;

/// Geometry of the decomposed simulation box as seen by this process.
///
/// Local coordinates are centered on the subdomain:
/// `global = local + global_start + local_size / 2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainInfo {
    pub global_size: Vec3,
    pub global_start: Vec3,
    pub local_size: Vec3,
}

impl DomainInfo {
    pub fn new(global_size: Vec3, global_start: Vec3, local_size: Vec3) -> Self {
        Self {
            global_size,
            global_start,
            local_size,
        }
    }

    /// A domain owned entirely by one process.
    pub fn undivided(global_size: Vec3) -> Self {
        Self::new(global_size, Vec3::ZERO, global_size)
    }

    pub fn local_to_global(&self, x: Vec3) -> Vec3 {
        x + self.global_start + 0.5 * self.local_size
    }

    pub fn global_to_local(&self, x: Vec3) -> Vec3 {
        x - self.global_start - 0.5 * self.local_size
    }

    /// Whether global point `x` lies in this process' subdomain (half-open box).
    pub fn in_subdomain(&self, x: Vec3) -> bool {
        let end = self.global_start + self.local_size;
        x.cmpge(self.global_start).all() && x.cmplt(end).all()
    }
}

/// Global quantities every subsystem reads each step.
///
/// Created once with the domain and time step, advanced once per step by the
/// driver, and replaced wholesale on restart.
#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    pub domain: DomainInfo,
    pub dt: f32,
    pub current_time: f64,
    pub current_step: i64,
}

impl SimState {
    pub fn new(domain: DomainInfo, dt: f32) -> Self {
        Self {
            domain,
            dt,
            current_time: 0.0,
            current_step: 0,
        }
    }

    /// Reset time and step to zero; domain and `dt` are kept.
    pub fn reinit_time(&mut self) {
        self.current_time = 0.0;
        self.current_step = 0;
    }

    /// Move to the next step.
    pub fn advance(&mut self) {
        self.current_time += f64::from(self.dt);
        self.current_step += 1;
    }

    /// Save the state into `folder`. Only the coordinator writes; other processes
    /// return immediately.
    pub fn checkpoint(&self, group: &dyn ProcessGroup, folder: &Path) -> Result<(), StateError> {
        if !group.is_coordinator() {
            return Ok(());
        }

        let path = folder.join(STATE_FILE_NAME);
        write_atomic(&path, self.to_record().as_bytes())
            .map_err(|source| StateError::Write { path: path.clone(), source })?;
        debug!("wrote simulation state at step {} to {:?}", self.current_step, path);
        Ok(())
    }

    /// Overwrite the state from the record in `folder`. Only the coordinator reads.
    ///
    /// On error nothing is modified. Callers must not keep running with the old
    /// state: a failed restore is fatal to the run.
    pub fn restart(&mut self, group: &dyn ProcessGroup, folder: &Path) -> Result<(), StateError> {
        if !group.is_coordinator() {
            return Ok(());
        }

        let path = folder.join(STATE_FILE_NAME);
        let corrupt = |reason: String| StateError::RestoreFileMissingOrCorrupt {
            path: path.clone(),
            reason,
        };
        let record = fs::read_to_string(&path).map_err(|e| corrupt(e.to_string()))?;
        *self = Self::from_record(&record).map_err(corrupt)?;
        info!(
            "restored simulation state from {:?}: step {}, time {}",
            path, self.current_step, self.current_time
        );
        Ok(())
    }

    // Fixed field order, whitespace separated. `{}` prints the shortest string
    // that parses back to the same float, so the record is bit-exact.
    fn to_record(&self) -> String {
        let d = &self.domain;
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {}\n",
            d.global_size.x,
            d.global_size.y,
            d.global_size.z,
            d.global_start.x,
            d.global_start.y,
            d.global_start.z,
            d.local_size.x,
            d.local_size.y,
            d.local_size.z,
            self.dt,
            self.current_time,
            self.current_step
        )
    }

    fn from_record(record: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = record.split_whitespace().collect();
        if tokens.len() != RECORD_FIELDS {
            return Err(format!("expected {RECORD_FIELDS} fields, found {}", tokens.len()));
        }

        let float = |i: usize| -> Result<f32, String> {
            tokens[i]
                .parse::<f32>()
                .map_err(|e| format!("field {i} ('{}'): {e}", tokens[i]))
        };
        let vec3 = |i: usize| -> Result<Vec3, String> {
            Ok(Vec3::new(float(i)?, float(i + 1)?, float(i + 2)?))
        };

        let domain = DomainInfo::new(vec3(0)?, vec3(3)?, vec3(6)?);
        let dt = float(9)?;
        let current_time = tokens[10]
            .parse::<f64>()
            .map_err(|e| format!("field 10 ('{}'): {e}", tokens[10]))?;
        let current_step = tokens[11]
            .parse::<i64>()
            .map_err(|e| format!("field 11 ('{}'): {e}", tokens[11]))?;

        Ok(Self {
            domain,
            dt,
            current_time,
            current_step,
        })
    }
}
