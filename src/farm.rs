//! Building a farm: a Park over a fresh [`SharedRegion`] plus the
//! cloneable handle that Refs connect through.

use std::sync::Arc;

use farm_abi::LayoutHash;
use tracing::info;

use crate::config::FarmConfig;
use crate::error::FarmError;
use crate::fd::Fd;
use crate::park::Park;
use crate::region::SharedRegion;

/// Collects the initial descriptors of a farm.
///
/// Slots 0, 1 and 2 are reserved for the standard streams; descriptors
/// added with [`fd`](Self::fd) start at 3. Arena size and slot count come
/// from the [`FarmConfig`] the builder is created with.
pub struct FarmBuilder {
    config: FarmConfig,
    fds: Vec<Option<Box<dyn Fd>>>,
    visible: Option<Vec<u32>>,
}

impl FarmBuilder {
    pub fn new(config: FarmConfig) -> Self {
        Self {
            config,
            fds: vec![None, None, None],
            visible: None,
        }
    }

    pub fn stdin(mut self, fd: impl Fd + 'static) -> Self {
        self.fds[0] = Some(Box::new(fd));
        self
    }

    pub fn stdout(mut self, fd: impl Fd + 'static) -> Self {
        self.fds[1] = Some(Box::new(fd));
        self
    }

    pub fn stderr(mut self, fd: impl Fd + 'static) -> Self {
        self.fds[2] = Some(Box::new(fd));
        self
    }

    /// Add a descriptor after the standard streams.
    pub fn fd(mut self, fd: impl Fd + 'static) -> Self {
        self.fds.push(Some(Box::new(fd)));
        self
    }

    pub fn boxed_fd(mut self, fd: Box<dyn Fd>) -> Self {
        self.fds.push(Some(fd));
        self
    }

    /// Restrict the descriptors Animals see by default. Without this every
    /// initial descriptor is visible.
    pub fn visible(mut self, fds: Vec<u32>) -> Self {
        self.visible = Some(fds);
        self
    }

    pub fn build(self) -> Result<Farm, FarmError> {
        let present = |i: usize| self.fds.get(i).is_some_and(Option::is_some).then_some(i as u32);
        let stdin = present(0);
        let stdout = present(1);
        let stderr = present(2);
        let default_fds = match self.visible {
            Some(fds) => fds,
            None => (0..self.fds.len()).filter_map(present).collect(),
        };
        let region = Arc::new(SharedRegion::new(self.config)?);
        let park = Park::new(Arc::clone(&region), self.fds)?;
        info!(?default_fds, "farm built");
        Ok(Farm {
            handle: FarmRefHandle {
                fingerprint: region.fingerprint(),
                region,
                stdin,
                stdout,
                stderr,
                default_fds,
            },
            park,
        })
    }
}

/// A running farm. Dropping it shuts the Park down.
pub struct Farm {
    park: Park,
    handle: FarmRefHandle,
}

impl Farm {
    pub fn builder(config: FarmConfig) -> FarmBuilder {
        FarmBuilder::new(config)
    }

    /// A handle Refs and Animals connect through. Cheap to clone and safe
    /// to move to other threads.
    pub fn get_ref(&self) -> FarmRefHandle {
        self.handle.clone()
    }

    pub fn park(&self) -> &Park {
        &self.park
    }

    pub fn shutdown(&self) {
        self.park.shutdown();
    }
}

/// The value-type description of a farm that a Ref is built from.
#[derive(Clone)]
pub struct FarmRefHandle {
    pub(crate) region: Arc<SharedRegion>,
    pub stdin: Option<u32>,
    pub stdout: Option<u32>,
    pub stderr: Option<u32>,
    pub default_fds: Vec<u32>,
    pub fingerprint: LayoutHash,
}

impl FarmRefHandle {
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

impl std::fmt::Debug for FarmRefHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmRefHandle")
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("default_fds", &self.default_fds)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}
