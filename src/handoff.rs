//! Boot-parameter handoff
//!
//! The previous boot stage leaves a singly-linked parameter list in its
//! own memory describing the images it loaded. This stage walks that
//! list exactly once, read-only, to find the next untrusted stage and
//! copies its entry point into process-owned storage; the source
//! memory may be reclaimed or become inaccessible once this stage
//! proceeds, so nothing may keep pointing into it.
//!
//! A missing next-stage entry is not an error here: publishing is
//! skipped and [`BootContext::next_stage_entry`] reports "not
//! available" later, when whatever performs the world switch asks.

use core::marker::PhantomData;

/// Parameter-block kind tag for a boot parameter list
pub const PARAM_BOOT_PARAMS: u8 = 0x05;
/// Minimum parameter-block version this stage understands
pub const PARAM_MIN_VERSION: u8 = 2;
/// Image identifier of the next untrusted stage
pub const NEXT_STAGE_IMAGE_ID: u32 = 5;

/// Why a handoff parameter block was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    /// Argument 0 of the handoff was zero
    NullPointer,
    /// The block header carries an unrecognized kind tag
    BadType(u8),
    /// The block version predates what this stage understands
    UnsupportedVersion(u8),
}

impl core::fmt::Display for HandoffError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HandoffError::NullPointer => write!(f, "parameter list pointer is null"),
            HandoffError::BadType(t) => write!(f, "unrecognized parameter block type {:#x}", t),
            HandoffError::UnsupportedVersion(v) => {
                write!(f, "parameter block version {} below minimum {}", v, PARAM_MIN_VERSION)
            }
        }
    }
}

/// Common header carried by every parameter structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ParamHeader {
    pub kind: u8,
    pub version: u8,
    pub size: u16,
    pub attr: u32,
}

/// Fixed-size launch record for a subsequent software image:
/// program counter, processor state flags and argument slots.
/// A zero program counter is the sentinel for "no image published".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub pc: usize,
    pub spsr: u32,
    pub args: [usize; 4],
}

impl EntryPointInfo {
    pub const fn zeroed() -> Self {
        Self { pc: 0, spsr: 0, args: [0; 4] }
    }
}

/// One node of the externally-owned parameter list
#[repr(C)]
#[derive(Debug)]
pub struct ParamNode {
    pub image_id: u32,
    pub ep_info: *const EntryPointInfo,
    pub next: *const ParamNode,
}

impl ParamNode {
    /// Entry point record of this node, if the producer attached one
    pub fn entry_point(&self) -> Option<&EntryPointInfo> {
        if self.ep_info.is_null() {
            None
        } else {
            // SAFETY: the handoff contract requires non-null ep_info
            // pointers to reference a live EntryPointInfo for as long
            // as the list itself is live.
            Some(unsafe { &*self.ep_info })
        }
    }
}

/// Head of the handoff parameter list left by the previous stage
#[repr(C)]
#[derive(Debug)]
pub struct BootParams {
    pub h: ParamHeader,
    pub head: *const ParamNode,
}

impl BootParams {
    /// Validate and borrow the parameter block at `addr`.
    ///
    /// Rejects a null pointer, a wrong kind tag and an
    /// under-versioned block; each of those is fatal upstream.
    ///
    /// # Safety
    ///
    /// A non-zero `addr` must point to a readable `BootParams`
    /// structure whose node and entry-point pointers stay valid for
    /// the returned lifetime.
    pub unsafe fn from_addr<'a>(addr: usize) -> Result<&'a BootParams, HandoffError> {
        if addr == 0 {
            return Err(HandoffError::NullPointer);
        }
        let params = unsafe { &*(addr as *const BootParams) };
        if params.h.kind != PARAM_BOOT_PARAMS {
            return Err(HandoffError::BadType(params.h.kind));
        }
        if params.h.version < PARAM_MIN_VERSION {
            return Err(HandoffError::UnsupportedVersion(params.h.version));
        }
        Ok(params)
    }

    /// Read-only forward traversal of the list
    pub fn iter(&self) -> ParamIter<'_> {
        ParamIter { cur: self.head, _lifetime: PhantomData }
    }

    /// Entry point of the first node matching `image_id`, or `None`
    /// if the list is exhausted first.
    pub fn find_entry(&self, image_id: u32) -> Option<&EntryPointInfo> {
        self.iter().find(|n| n.image_id == image_id).and_then(ParamNode::entry_point)
    }
}

/// Iterator over the borrowed node sequence. Never mutates the list
/// and terminates on the null `next` pointer.
pub struct ParamIter<'a> {
    cur: *const ParamNode,
    _lifetime: PhantomData<&'a ParamNode>,
}

impl<'a> Iterator for ParamIter<'a> {
    type Item = &'a ParamNode;

    fn next(&mut self) -> Option<&'a ParamNode> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: non-null next pointers in a validated list reference
        // live ParamNode structures owned by the previous stage.
        let node = unsafe { &*self.cur };
        self.cur = node.next;
        Some(node)
    }
}

// ============================================================================
// Published next-stage entry
// ============================================================================

/// Single-owner, write-once holder for the state this stage carries
/// from early setup to the eventual world switch. Constructed at
/// process start and threaded explicitly through the setup phases.
pub struct BootContext {
    next_stage: EntryPointInfo,
    early_setup_done: bool,
}

impl BootContext {
    pub const fn new() -> Self {
        Self { next_stage: EntryPointInfo::zeroed(), early_setup_done: false }
    }

    /// Copy the next stage's entry point out of the handoff list.
    /// May be called at most once, during early setup.
    pub fn publish(&mut self, ep: &EntryPointInfo) {
        debug_assert!(self.next_stage.pc == 0, "next-stage entry published twice");
        self.next_stage = *ep;
    }

    /// Forward a hardware-configuration blob discovered by this stage
    /// to the next one: argument slots 0 and 1 are cleared, slot 2
    /// carries the blob address. The original list entry is untouched.
    pub fn forward_hw_config(&mut self, hw_config: usize) {
        self.next_stage.args[0] = 0;
        self.next_stage.args[1] = 0;
        self.next_stage.args[2] = hw_config;
    }

    /// Mark early setup complete; the accessor below is legal from
    /// this point on.
    pub fn finish_early_setup(&mut self) {
        self.early_setup_done = true;
    }

    /// The published next-stage entry, or `None` when no matching
    /// image was found in the handoff list.
    ///
    /// Calling this before early setup completes is a programming
    /// error, not a runtime condition.
    pub fn next_stage_entry(&self) -> Option<&EntryPointInfo> {
        debug_assert!(self.early_setup_done, "next-stage entry queried before early setup");
        if self.next_stage.pc == 0 {
            None
        } else {
            Some(&self.next_stage)
        }
    }
}

impl Default for BootContext {
    fn default() -> Self {
        Self::new()
    }
}
