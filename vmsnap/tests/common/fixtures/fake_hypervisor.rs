//! Fake hypervisor for testing
//!
//! Keeps domains, disk top files and image backing pointers in memory while
//! creating and rewriting real files, so the inspector, copier and store work
//! against an actual file system. Failures are injected per test.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vmsnap::errors::{BackupError, Result};
use vmsnap::hypervisor::Hypervisor;
use vmsnap::types::{BackingRef, BlockJobHandle, BlockJobInfo, DiskInfo, SnapshotRequest};

/// How the block job of one disk behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobBehaviour {
    /// Reports running for `n` polls, then ready for pivot
    ReadyAfter(u32),
    /// Flattens and disappears without needing a pivot
    FinishesOnItsOwn,
    NeverFinishes,
    Fails,
    /// Becomes ready, but the pivot is refused
    PivotFails,
}

#[derive(Debug)]
struct FakeJob {
    behaviour: JobBehaviour,
    polls: u32,
    ready: bool,
}

#[derive(Default)]
struct State {
    domains: HashMap<String, Vec<DiskInfo>>,
    backing: HashMap<PathBuf, BackingRef>,
    jobs: HashMap<(String, String), FakeJob>,
    behaviours: HashMap<String, JobBehaviour>,
    snapshot_failure: Option<String>,
    detach_after_snapshot: Option<String>,
    grow_on_definition: Option<PathBuf>,
    snapshots: usize,
    pulls: usize,
    pivots: usize,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<State>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&self, domain: &str, disks: Vec<DiskInfo>) {
        self.state
            .lock()
            .unwrap()
            .domains
            .insert(domain.to_string(), disks);
    }

    /// Overrides the backing pointer stored in an image.
    pub fn set_backing(&self, path: &Path, backing: Option<BackingRef>) {
        let mut state = self.state.lock().unwrap();
        match backing {
            Some(backing) => {
                state.backing.insert(path.to_path_buf(), backing);
            }
            None => {
                state.backing.remove(path);
            }
        }
    }

    pub fn fail_snapshots(&self, reason: &str) {
        self.state.lock().unwrap().snapshot_failure = Some(reason.to_string());
    }

    pub fn set_job_behaviour(&self, device: &str, behaviour: JobBehaviour) {
        self.state
            .lock()
            .unwrap()
            .behaviours
            .insert(device.to_string(), behaviour);
    }

    /// Detaches `device` right after the next successful snapshot.
    pub fn detach_after_snapshot(&self, device: &str) {
        self.state.lock().unwrap().detach_after_snapshot = Some(device.to_string());
    }

    /// Appends to `path` when the domain definition is read, which happens
    /// between copying and validating a backup set.
    pub fn grow_file_on_definition(&self, path: &Path) {
        self.state.lock().unwrap().grow_on_definition = Some(path.to_path_buf());
    }

    pub fn top_path(&self, domain: &str, device: &str) -> PathBuf {
        let state = self.state.lock().unwrap();
        state.domains[domain]
            .iter()
            .find(|disk| disk.device == device)
            .map(|disk| disk.path.clone())
            .unwrap()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().unwrap().pulls
    }

    pub fn pivot_count(&self) -> usize {
        self.state.lock().unwrap().pivots
    }

    /// Pulls the chain into the top file: the top ends up with every
    /// layer's bytes, base first, and no backing pointer.
    fn flatten(state: &mut State, top: &Path) {
        let mut layers = Vec::new();
        let mut next = state.backing.get(top).cloned();
        while let Some(link) = next {
            layers.push(link.path.clone());
            next = state.backing.get(&link.path).cloned();
        }

        let mut merged = Vec::new();
        for layer in layers.iter().rev() {
            merged.extend(fs::read(layer).unwrap_or_default());
        }
        merged.extend(fs::read(top).unwrap_or_default());
        fs::write(top, merged).unwrap();

        state.backing.remove(top);
    }
}

fn domain_not_found(domain: &str) -> BackupError {
    BackupError::DomainNotFound {
        domain: domain.to_string(),
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_disks(&self, domain: &str) -> Result<Vec<DiskInfo>> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .get(domain)
            .cloned()
            .ok_or_else(|| domain_not_found(domain))
    }

    async fn get_backing_file(&self, path: &Path) -> Result<Option<BackingRef>> {
        Ok(self.state.lock().unwrap().backing.get(path).cloned())
    }

    async fn create_external_snapshot(&self, domain: &str, request: &SnapshotRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let failed = |reason: String| BackupError::SnapshotFailed {
            domain: domain.to_string(),
            reason,
        };

        if let Some(reason) = state.snapshot_failure.clone() {
            return Err(failed(reason));
        }
        let disks = state
            .domains
            .get(domain)
            .cloned()
            .ok_or_else(|| domain_not_found(domain))?;

        // All checks first: either every disk switches or none does.
        let listed: HashSet<&str> = request.disks.iter().map(|spec| spec.device.as_str()).collect();
        if listed.len() != disks.len() || disks.iter().any(|disk| !listed.contains(disk.device.as_str())) {
            return Err(failed("snapshot must cover every disk".to_string()));
        }
        if let Some(spec) = request.disks.iter().find(|spec| spec.path.exists()) {
            return Err(failed(format!("file {} already exists", spec.path.display())));
        }

        let mut updated = disks;
        for spec in &request.disks {
            let disk = updated
                .iter_mut()
                .find(|disk| disk.device == spec.device)
                .unwrap();
            let mut file = fs::File::create(&spec.path).unwrap();
            write!(file, "overlay {} {}", spec.device, request.name).unwrap();

            state.backing.insert(
                spec.path.clone(),
                BackingRef {
                    path: disk.path.clone(),
                    format: disk.format.clone(),
                },
            );
            disk.path = spec.path.clone();
        }

        if let Some(device) = state.detach_after_snapshot.take() {
            updated.retain(|disk| disk.device != device);
        }
        state.domains.insert(domain.to_string(), updated);
        state.snapshots += 1;
        Ok(request.name.clone())
    }

    async fn start_block_pull(&self, domain: &str, device: &str) -> Result<BlockJobHandle> {
        let mut state = self.state.lock().unwrap();
        let top_path = state
            .domains
            .get(domain)
            .ok_or_else(|| domain_not_found(domain))?
            .iter()
            .find(|disk| disk.device == device)
            .map(|disk| disk.path.clone())
            .ok_or_else(|| BackupError::BlockJobFailed {
                domain: domain.to_string(),
                device: device.to_string(),
                reason: "no such disk".to_string(),
            })?;

        let behaviour = state
            .behaviours
            .get(device)
            .copied()
            .unwrap_or(JobBehaviour::ReadyAfter(1));
        state.jobs.insert(
            (domain.to_string(), device.to_string()),
            FakeJob {
                behaviour,
                polls: 0,
                ready: false,
            },
        );
        state.pulls += 1;

        Ok(BlockJobHandle {
            domain: domain.to_string(),
            device: device.to_string(),
            top_path,
        })
    }

    async fn poll_block_job(&self, job: &BlockJobHandle) -> Result<BlockJobInfo> {
        let mut state = self.state.lock().unwrap();
        let key = (job.domain.clone(), job.device.clone());
        let Some(fake) = state.jobs.get_mut(&key) else {
            return Ok(BlockJobInfo::completed());
        };
        fake.polls += 1;
        let (behaviour, polls) = (fake.behaviour, fake.polls);

        let info = match behaviour {
            JobBehaviour::ReadyAfter(n) if polls <= n => BlockJobInfo::running(50),
            JobBehaviour::ReadyAfter(_) | JobBehaviour::PivotFails => {
                if let Some(fake) = state.jobs.get_mut(&key) {
                    fake.ready = true;
                }
                BlockJobInfo::ready()
            }
            JobBehaviour::NeverFinishes => BlockJobInfo::running(42),
            JobBehaviour::Fails => BlockJobInfo::failed("I/O error reading backing file"),
            JobBehaviour::FinishesOnItsOwn => {
                state.jobs.remove(&key);
                Self::flatten(&mut state, &job.top_path);
                BlockJobInfo::completed()
            }
        };
        Ok(info)
    }

    async fn pivot_block_job(&self, job: &BlockJobHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (job.domain.clone(), job.device.clone());
        let pivot_failed = |reason: &str| BackupError::PivotFailed {
            domain: job.domain.clone(),
            device: job.device.clone(),
            reason: reason.to_string(),
        };

        match state.jobs.get(&key) {
            None => return Err(pivot_failed("no active block job")),
            Some(fake) if !fake.ready => return Err(pivot_failed("job is not ready")),
            Some(fake) if fake.behaviour == JobBehaviour::PivotFails => {
                return Err(pivot_failed("hypervisor refused the pivot"));
            }
            Some(_) => {}
        }

        state.jobs.remove(&key);
        Self::flatten(&mut state, &job.top_path);
        state.pivots += 1;
        Ok(())
    }

    async fn domain_definition(&self, domain: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.domains.contains_key(domain) {
            return Err(domain_not_found(domain));
        }
        if let Some(path) = state.grow_on_definition.take() {
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"late guest write").unwrap();
        }
        Ok(format!("<domain type='kvm'><name>{}</name></domain>", domain))
    }
}
