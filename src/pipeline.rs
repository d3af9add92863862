//! Batch session: one `DropAnalysis` per captured image, run on a worker
//! pool.
//!
//! The session itself is a single-threaded coordinator. `dispatch` hands
//! runnable analyses to the pool and returns at once, `poll` collects
//! finished ones. While an analysis is on a worker the session only keeps
//! its cancellation token; region and constant edits aimed at it are queued
//! and applied when it comes back, after which it is dispatched again.

use std::sync::mpsc::{self, Receiver, Sender};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::analysis::{AnalysisStatus, DropAnalysis, StageOptions};
use crate::cancellation::CancellationToken;
use crate::config::Config;
use crate::errors::{PendantDropError, Result};
use crate::image_io::InputImage;
use crate::image_utils::Region;
use crate::physical_properties::PhysicalConstants;

/// One row of the aggregate report. Values of stages that did not complete
/// are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimelineRow {
    /// s
    pub timestamp: f64,
    pub interfacial_tension: Option<f64>,
    pub volume: Option<f64>,
    pub surface_area: Option<f64>,
    pub apex_radius: Option<f64>,
    pub worthington: Option<f64>,
    pub bond_number: Option<f64>,
    /// degrees
    pub image_angle: Option<f64>,
    /// px
    pub apex_x: Option<f64>,
    pub apex_y: Option<f64>,
    pub needle_width: Option<f64>,
}

impl TimelineRow {
    pub fn from_analysis(analysis: &DropAnalysis) -> Self {
        let properties = analysis.properties();
        let fit = analysis.fit().map(|f| f.parameters);

        Self {
            timestamp: analysis.timestamp(),
            interfacial_tension: properties.map(|p| p.interfacial_tension),
            volume: properties.map(|p| p.volume),
            surface_area: properties.map(|p| p.surface_area),
            apex_radius: properties.map(|p| p.apex_radius),
            worthington: properties.map(|p| p.worthington),
            bond_number: fit.map(|f| f.bond_number),
            image_angle: fit.map(|f| f.rotation.to_degrees()),
            apex_x: fit.map(|f| f.apex_x),
            apex_y: fit.map(|f| f.apex_y),
            needle_width: analysis.calibration().filter(|c| c.is_valid()).map(|c| c.width_px),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Edit {
    DropRegion(Region),
    NeedleRegion(Region),
    Constants(PhysicalConstants),
    Cancel,
}

enum Slot {
    Idle(Box<DropAnalysis>),
    InFlight {
        cancel: CancellationToken,
        timestamp: f64,
        is_replicated: bool,
        queued: Vec<Edit>,
    },
}

struct Completion {
    generation: u64,
    index: usize,
    analysis: Box<DropAnalysis>,
}

pub struct AnalysisSession {
    options: StageOptions,
    drop_region: Region,
    needle_region: Region,
    constants: PhysicalConstants,
    pool: ThreadPool,
    slots: Vec<Slot>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    /// Bumped by `clear` so completions of discarded analyses are ignored
    generation: u64,
    saved: bool,
}

impl AnalysisSession {
    pub fn new(config: &Config) -> Result<Self> {
        let num_threads = if !config.use_parallel {
            1
        } else if config.num_threads > 0 {
            config.num_threads
        } else {
            num_cpus::get()
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("drop-worker-{}", i))
            .build()
            .map_err(|e| PendantDropError::Config(format!("Failed to build worker pool: {}", e)))?;
        log::debug!("analysis pool with {} workers", num_threads);

        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            options: StageOptions::from_config(config),
            drop_region: config.drop_region,
            needle_region: config.needle_region,
            constants: config.physical_constants(),
            pool,
            slots: Vec::new(),
            sender,
            receiver,
            generation: 0,
            saved: false,
        })
    }

    /// Replace the session content with one pending analysis per image
    pub fn start(&mut self, images: Vec<InputImage>) -> Result<()> {
        if images.is_empty() {
            return Err(PendantDropError::NoImages);
        }

        self.clear();
        for image in images {
            self.add_image(image);
        }
        log::info!("Started a session of {} drops", self.slots.len());

        Ok(())
    }

    /// Append one image to the session, returning its index
    pub fn add_image(&mut self, image: InputImage) -> usize {
        let analysis = DropAnalysis::new(image, self.drop_region, self.needle_region, self.constants);
        self.slots.push(Slot::Idle(Box::new(analysis)));
        self.saved = false;
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of analyses currently on a worker
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::InFlight { .. })).count()
    }

    /// The analysis at `index`, unless it is running
    pub fn analysis(&self, index: usize) -> Option<&DropAnalysis> {
        match self.slots.get(index)? {
            Slot::Idle(analysis) => Some(analysis),
            Slot::InFlight { .. } => None,
        }
    }

    /// Idle analyses with their index
    pub fn analyses(&self) -> impl Iterator<Item = (usize, &DropAnalysis)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Idle(analysis) => Some((i, analysis.as_ref())),
            Slot::InFlight { .. } => None,
        })
    }

    /// Move every runnable analysis onto the pool. Never blocks.
    pub fn dispatch(&mut self) -> usize {
        (0..self.slots.len()).filter(|&i| self.dispatch_one(i)).count()
    }

    fn dispatch_one(&mut self, index: usize) -> bool {
        let runnable = matches!(&self.slots[index], Slot::Idle(a) if a.is_runnable());
        if !runnable {
            return false;
        }

        let placeholder = Slot::InFlight {
            cancel: CancellationToken::new(),
            timestamp: 0.0,
            is_replicated: false,
            queued: Vec::new(),
        };
        let Slot::Idle(mut analysis) = std::mem::replace(&mut self.slots[index], placeholder) else {
            return false;
        };

        self.slots[index] = Slot::InFlight {
            cancel: analysis.cancel_token(),
            timestamp: analysis.timestamp(),
            is_replicated: analysis.is_image_replicated(),
            queued: Vec::new(),
        };

        let sender = self.sender.clone();
        let options = self.options;
        let generation = self.generation;
        self.pool.spawn(move || {
            analysis.run(&options);
            // The session may already be gone
            let _ = sender.send(Completion { generation, index, analysis });
        });

        true
    }

    /// Collect finished analyses without blocking. Returns how many came
    /// back.
    pub fn poll(&mut self) -> usize {
        let mut received = 0;
        while let Ok(completion) = self.receiver.try_recv() {
            self.complete(completion);
            received += 1;
        }
        received
    }

    /// Dispatch and block until no analysis is running
    pub fn wait(&mut self) {
        self.dispatch();
        while self.in_flight() > 0 {
            match self.receiver.recv() {
                Ok(completion) => self.complete(completion),
                Err(_) => break,
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { generation, index, mut analysis } = completion;
        if generation != self.generation || index >= self.slots.len() {
            return;
        }

        let queued = match &mut self.slots[index] {
            Slot::InFlight { queued, .. } => std::mem::take(queued),
            Slot::Idle(_) => return,
        };

        match analysis.status() {
            AnalysisStatus::Done => log::debug!("{}: done", analysis.input().filename),
            status => log::debug!("{}: finished as {:?}", analysis.input().filename, status),
        }

        for edit in queued {
            apply_edit(&mut analysis, edit);
        }
        let rerun = analysis.is_runnable();
        self.slots[index] = Slot::Idle(analysis);

        if rerun {
            self.dispatch_one(index);
        }
    }

    fn edit(&mut self, index: usize, edit: Edit) {
        let Some(slot) = self.slots.get_mut(index) else {
            log::warn!("no drop at index {}", index);
            return;
        };
        match slot {
            Slot::Idle(analysis) => apply_edit(analysis, edit),
            Slot::InFlight { cancel, queued, .. } => {
                if let Edit::Cancel = edit {
                    cancel.cancel();
                }
                queued.push(edit);
            }
        }
        self.saved = false;
    }

    pub fn set_drop_region(&mut self, index: usize, region: Region) {
        self.edit(index, Edit::DropRegion(region));
    }

    pub fn set_needle_region(&mut self, index: usize, region: Region) {
        self.edit(index, Edit::NeedleRegion(region));
    }

    /// Regions given to analyses created from now on
    pub fn set_default_regions(&mut self, drop_region: Region, needle_region: Region) {
        self.drop_region = drop_region;
        self.needle_region = needle_region;
    }

    /// New physical constants for every analysis, recomputing only the
    /// properties stage
    pub fn set_constants(&mut self, constants: PhysicalConstants) {
        self.constants = constants;
        for index in 0..self.slots.len() {
            self.edit(index, Edit::Constants(constants));
        }
    }

    pub fn cancel(&mut self, index: usize) {
        self.edit(index, Edit::Cancel);
    }

    pub fn cancel_all(&mut self) {
        for index in 0..self.slots.len() {
            self.edit(index, Edit::Cancel);
        }
    }

    /// Cancel and drop every analysis
    pub fn clear(&mut self) {
        self.cancel_all();
        self.slots.clear();
        self.generation += 1;
        self.saved = false;
    }

    /// Aggregate report sorted by input timestamp, with failed, cancelled
    /// and running drops included as rows without values
    pub fn timeline(&self) -> Vec<TimelineRow> {
        let mut rows: Vec<TimelineRow> = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Idle(analysis) => TimelineRow::from_analysis(analysis),
                Slot::InFlight { timestamp, .. } => TimelineRow {
                    timestamp: *timestamp,
                    ..TimelineRow::default()
                },
            })
            .collect();
        rows.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        rows
    }

    /// Whether the session can be dropped without losing data
    pub fn check_if_safe_to_discard(&self) -> bool {
        self.saved
            || self.slots.is_empty()
            || self.slots.iter().all(|slot| match slot {
                Slot::Idle(analysis) => analysis.is_image_replicated(),
                Slot::InFlight { is_replicated, .. } => *is_replicated,
            })
    }

    pub fn mark_saved(&mut self) {
        self.saved = true;
    }
}

fn apply_edit(analysis: &mut DropAnalysis, edit: Edit) {
    match edit {
        Edit::DropRegion(region) => analysis.set_drop_region(region),
        Edit::NeedleRegion(region) => analysis.set_needle_region(region),
        Edit::Constants(constants) => analysis.set_constants(constants),
        Edit::Cancel => analysis.cancel(),
    }
}
