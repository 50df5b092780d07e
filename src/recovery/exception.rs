//! CPU exception classification and recovery policy.
//!
//! The VCPU engine reports every guest exception it cannot resolve on its own.
//! [`ExceptionHandler::handle_exception`] turns it into an [`ErrorContext`],
//! appends it to a bounded log and picks exactly one [`RecoveryAction`].
//!
//! # Default Policy
//!
//! | Vector | Exception | Action | Retryable |
//! |--------|-----------|--------|-----------|
//! | 8  | #DF double fault   | Shutdown (forced) | no |
//! | 18 | #MC machine check  | Shutdown (forced) | no |
//! | 14 | #PF page fault     | ResetVcpu | yes |
//! | 13 | #GP general protection | PauseVm | no |
//! | 6  | #UD invalid opcode | Ignore | no |
//! | *  | anything else      | PauseVm | no |
//!
//! A registered per-vector handler overrides the default, except for #DF and
//! #MC which always shut down.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::watchdog::CycleCounter;

pub const DIVIDE_ERROR: u8 = 0;
pub const DEBUG: u8 = 1;
pub const NMI: u8 = 2;
pub const BREAKPOINT: u8 = 3;
pub const OVERFLOW: u8 = 4;
pub const BOUND_RANGE: u8 = 5;
pub const INVALID_OPCODE: u8 = 6;
pub const DEVICE_NOT_AVAILABLE: u8 = 7;
pub const DOUBLE_FAULT: u8 = 8;
pub const COPROCESSOR_OVERRUN: u8 = 9;
pub const INVALID_TSS: u8 = 10;
pub const SEGMENT_NOT_PRESENT: u8 = 11;
pub const STACK_FAULT: u8 = 12;
pub const GENERAL_PROTECTION: u8 = 13;
pub const PAGE_FAULT: u8 = 14;
pub const X87_FLOATING_POINT: u8 = 16;
pub const ALIGNMENT_CHECK: u8 = 17;
pub const MACHINE_CHECK: u8 = 18;

/// Mnemonic and description for vectors 0-18.
pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        DIVIDE_ERROR => "#DE divide error",
        DEBUG => "#DB debug",
        NMI => "NMI",
        BREAKPOINT => "#BP breakpoint",
        OVERFLOW => "#OF overflow",
        BOUND_RANGE => "#BR bound range exceeded",
        INVALID_OPCODE => "#UD invalid opcode",
        DEVICE_NOT_AVAILABLE => "#NM device not available",
        DOUBLE_FAULT => "#DF double fault",
        COPROCESSOR_OVERRUN => "coprocessor segment overrun",
        INVALID_TSS => "#TS invalid TSS",
        SEGMENT_NOT_PRESENT => "#NP segment not present",
        STACK_FAULT => "#SS stack-segment fault",
        GENERAL_PROTECTION => "#GP general protection",
        PAGE_FAULT => "#PF page fault",
        15 => "reserved",
        X87_FLOATING_POINT => "#MF x87 floating-point",
        ALIGNMENT_CHECK => "#AC alignment check",
        MACHINE_CHECK => "#MC machine check",
        _ => "unknown exception",
    }
}

/// The eight possible outcomes of exception handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecoveryAction {
    /// Skip the faulting instruction and continue.
    Ignore,
    /// Re-execute the faulting instruction.
    Retry,
    /// Reflect the exception into the guest IDT.
    InjectGuest,
    /// Reset the device implicated in the fault.
    ResetDevice,
    ResetVcpu,
    ResetVm,
    PauseVm,
    Shutdown,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ignore => "ignore",
            Self::Retry => "retry",
            Self::InjectGuest => "inject_guest",
            Self::ResetDevice => "reset_device",
            Self::ResetVcpu => "reset_vcpu",
            Self::ResetVm => "reset_vm",
            Self::PauseVm => "pause_vm",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

impl FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ignore" => Self::Ignore,
            "retry" => Self::Retry,
            "inject_guest" => Self::InjectGuest,
            "reset_device" => Self::ResetDevice,
            "reset_vcpu" => Self::ResetVcpu,
            "reset_vm" => Self::ResetVm,
            "pause_vm" => Self::PauseVm,
            "shutdown" => Self::Shutdown,
            other => return Err(format!("unknown recovery action: {}", other)),
        })
    }
}

/// What the VCPU engine knows about a fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub vector: u8,
    pub error_code: u32,
    pub vcpu: u32,
    pub rip: u64,
    pub cr3: u64,
}

/// One entry of the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub vector: u8,
    pub error_code: u32,
    pub classification: &'static str,
    /// Cycle counter value when the exception was handled.
    pub timestamp: u64,
    pub vcpu: u32,
    pub rip: u64,
    pub cr3: u64,
    pub action: RecoveryAction,
    pub retryable: bool,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] vcpu{} {} (vector {}, code {:#x}) rip={:#x} cr3={:#x} -> {}{}",
            self.timestamp,
            self.vcpu,
            self.classification,
            self.vector,
            self.error_code,
            self.rip,
            self.cr3,
            self.action,
            if self.retryable { " (retryable)" } else { "" }
        )
    }
}

/// Custom per-vector policy.
pub type ExceptionCallback = Box<dyn Fn(&ErrorContext) -> RecoveryAction + Send>;

/// Classifies exceptions and keeps the bounded error log.
pub struct ExceptionHandler {
    clock: Arc<dyn CycleCounter>,
    handlers: HashMap<u8, ExceptionCallback>,
    log: VecDeque<ErrorContext>,
    capacity: usize,
    counts: [u64; 32],
}

impl ExceptionHandler {
    pub fn new(clock: Arc<dyn CycleCounter>, capacity: usize) -> Self {
        Self {
            clock,
            handlers: HashMap::new(),
            log: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            counts: [0; 32],
        }
    }

    pub fn register_handler(&mut self, vector: u8, handler: ExceptionCallback) {
        self.handlers.insert(vector, handler);
    }

    pub fn unregister_handler(&mut self, vector: u8) {
        self.handlers.remove(&vector);
    }

    /// Action and retryability when no handler is registered.
    pub fn default_action(vector: u8) -> (RecoveryAction, bool) {
        match vector {
            DOUBLE_FAULT | MACHINE_CHECK => (RecoveryAction::Shutdown, false),
            PAGE_FAULT => (RecoveryAction::ResetVcpu, true),
            GENERAL_PROTECTION => (RecoveryAction::PauseVm, false),
            INVALID_OPCODE => (RecoveryAction::Ignore, false),
            _ => (RecoveryAction::PauseVm, false),
        }
    }

    /// Classify, log and decide.
    pub fn handle_exception(&mut self, info: ExceptionInfo) -> ErrorContext {
        let (default, retryable) = Self::default_action(info.vector);
        let mut ctx = ErrorContext {
            vector: info.vector,
            error_code: info.error_code,
            classification: exception_name(info.vector),
            timestamp: self.clock.cycles(),
            vcpu: info.vcpu,
            rip: info.rip,
            cr3: info.cr3,
            action: default,
            retryable,
        };

        let fatal = matches!(info.vector, DOUBLE_FAULT | MACHINE_CHECK);
        if !fatal {
            if let Some(handler) = self.handlers.get(&info.vector) {
                ctx.action = handler(&ctx);
                ctx.retryable = ctx.action == RecoveryAction::Retry;
            }
        }

        if let Some(count) = self.counts.get_mut(info.vector as usize) {
            *count += 1;
        }

        match ctx.action {
            RecoveryAction::Shutdown | RecoveryAction::ResetVm => error!("{}", ctx),
            RecoveryAction::Ignore | RecoveryAction::Retry => info!("{}", ctx),
            _ => warn!("{}", ctx),
        }

        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(ctx.clone());
        ctx
    }

    /// Oldest-first view of the retained log.
    pub fn error_log(&self) -> impl Iterator<Item = &ErrorContext> {
        self.log.iter()
    }

    pub fn last_error(&self) -> Option<&ErrorContext> {
        self.log.back()
    }

    /// How many times `vector` was handled, including entries evicted from the log.
    pub fn count(&self, vector: u8) -> u64 {
        self.counts.get(vector as usize).copied().unwrap_or(0)
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::watchdog::ManualClock;

    fn handler(capacity: usize) -> (ExceptionHandler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (ExceptionHandler::new(clock.clone(), capacity), clock)
    }

    fn fault(vector: u8) -> ExceptionInfo {
        ExceptionInfo {
            vector,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_policy() {
        let (mut h, _) = handler(16);
        assert_eq!(h.handle_exception(fault(PAGE_FAULT)).action, RecoveryAction::ResetVcpu);
        assert!(h.last_error().unwrap().retryable);
        assert_eq!(
            h.handle_exception(fault(GENERAL_PROTECTION)).action,
            RecoveryAction::PauseVm
        );
        assert_eq!(h.handle_exception(fault(INVALID_OPCODE)).action, RecoveryAction::Ignore);
        assert_eq!(h.handle_exception(fault(DIVIDE_ERROR)).action, RecoveryAction::PauseVm);
    }

    #[test]
    fn test_fatal_vectors_ignore_custom_handlers() {
        let (mut h, _) = handler(16);
        h.register_handler(DOUBLE_FAULT, Box::new(|_| RecoveryAction::Ignore));
        h.register_handler(MACHINE_CHECK, Box::new(|_| RecoveryAction::Retry));
        assert_eq!(h.handle_exception(fault(DOUBLE_FAULT)).action, RecoveryAction::Shutdown);
        assert_eq!(h.handle_exception(fault(MACHINE_CHECK)).action, RecoveryAction::Shutdown);
    }

    #[test]
    fn test_custom_handler_overrides_default() {
        let (mut h, _) = handler(16);
        h.register_handler(GENERAL_PROTECTION, Box::new(|ctx| {
            assert_eq!(ctx.error_code, 0x10);
            RecoveryAction::InjectGuest
        }));
        let ctx = h.handle_exception(ExceptionInfo {
            vector: GENERAL_PROTECTION,
            error_code: 0x10,
            ..Default::default()
        });
        assert_eq!(ctx.action, RecoveryAction::InjectGuest);
        assert!(!ctx.retryable);

        h.unregister_handler(GENERAL_PROTECTION);
        assert_eq!(
            h.handle_exception(fault(GENERAL_PROTECTION)).action,
            RecoveryAction::PauseVm
        );
    }

    #[test]
    fn test_context_captures_fault_state() {
        let (mut h, clock) = handler(4);
        clock.set(12345);
        let ctx = h.handle_exception(ExceptionInfo {
            vector: PAGE_FAULT,
            error_code: 2,
            vcpu: 1,
            rip: 0xFFFF_8000_0000_1000,
            cr3: 0x1000,
        });
        assert_eq!(ctx.timestamp, 12345);
        assert_eq!(ctx.vcpu, 1);
        assert_eq!(ctx.rip, 0xFFFF_8000_0000_1000);
        assert_eq!(ctx.cr3, 0x1000);
        assert_eq!(ctx.classification, "#PF page fault");
    }

    #[test]
    fn test_log_is_bounded() {
        let (mut h, _) = handler(3);
        for v in 0..5 {
            h.handle_exception(fault(v));
        }
        let vectors: Vec<u8> = h.error_log().map(|c| c.vector).collect();
        assert_eq!(vectors, vec![2, 3, 4]);
        assert_eq!(h.count(0), 1);
    }

    #[test]
    fn test_action_round_trips_through_str() {
        for action in [RecoveryAction::Ignore, RecoveryAction::ResetDevice, RecoveryAction::Shutdown] {
            assert_eq!(action.to_string().parse::<RecoveryAction>(), Ok(action));
        }
        assert!("explode".parse::<RecoveryAction>().is_err());
    }
}
