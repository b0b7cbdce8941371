//! Trap causes and precise trap delivery
//!
//! Synchronous exceptions propagate out of the interpreter as `Err(Trap)`;
//! interrupts are synthesized by `check_pending` at hart-loop safe points.
//! Delivery honours medeleg/mideleg, writes the `{m,s}` cause/epc/tval CSRs,
//! swaps the privilege level and vectors the PC.

use super::csr::*;
use super::{Hart, PrivilegeLevel, Xlen};

/// Exception or interrupt cause, with `tval` payload where defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    // Exceptions
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),

    // Interrupts
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

pub const CAUSE_FETCH_PAGE_FAULT: u64 = 12;
pub const CAUSE_LOAD_PAGE_FAULT: u64 = 13;
pub const CAUSE_STORE_PAGE_FAULT: u64 = 15;

impl Trap {
    /// Cause number without the interrupt bit.
    pub fn cause(&self) -> u64 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU => 8,
            Trap::EnvironmentCallFromS => 9,
            Trap::EnvironmentCallFromM => 11,
            Trap::InstructionPageFault(_) => 12,
            Trap::LoadPageFault(_) => 13,
            Trap::StorePageFault(_) => 15,

            Trap::SupervisorSoftwareInterrupt => 1,
            Trap::MachineSoftwareInterrupt => 3,
            Trap::SupervisorTimerInterrupt => 5,
            Trap::MachineTimerInterrupt => 7,
            Trap::SupervisorExternalInterrupt => 9,
            Trap::MachineExternalInterrupt => 11,
        }
    }

    /// Full `xcause` value, interrupt bit placed per XLEN.
    pub fn code(&self, xlen: Xlen) -> u64 {
        let cause = self.cause();
        if self.is_interrupt() {
            cause | interrupt_bit(xlen)
        } else {
            cause
        }
    }

    /// `xtval` payload.
    pub fn value(&self) -> u64 {
        match self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v)
            | Trap::InstructionPageFault(v)
            | Trap::LoadPageFault(v)
            | Trap::StorePageFault(v) => *v,
            _ => 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Trap::SupervisorSoftwareInterrupt
                | Trap::MachineSoftwareInterrupt
                | Trap::SupervisorTimerInterrupt
                | Trap::MachineTimerInterrupt
                | Trap::SupervisorExternalInterrupt
                | Trap::MachineExternalInterrupt
        )
    }

    /// Rebuild a trap from an exception cause number produced by the MMU.
    pub fn from_cause(cause: u64, tval: u64) -> Self {
        match cause {
            0 => Trap::InstructionAddressMisaligned(tval),
            1 => Trap::InstructionAccessFault(tval),
            3 => Trap::Breakpoint(tval),
            4 => Trap::LoadAddressMisaligned(tval),
            5 => Trap::LoadAccessFault(tval),
            6 => Trap::StoreAddressMisaligned(tval),
            7 => Trap::StoreAccessFault(tval),
            12 => Trap::InstructionPageFault(tval),
            13 => Trap::LoadPageFault(tval),
            15 => Trap::StorePageFault(tval),
            _ => Trap::IllegalInstruction(tval),
        }
    }
}

#[inline(always)]
pub fn interrupt_bit(xlen: Xlen) -> u64 {
    match xlen {
        Xlen::Rv32 => 1 << 31,
        Xlen::Rv64 => 1 << 63,
    }
}

/// Highest-priority deliverable interrupt for the hart's current state, or
/// None. Priority per the privileged spec: MEI, MSI, MTI, SEI, SSI, STI.
pub fn check_pending(hart: &Hart) -> Option<Trap> {
    let pending = hart.csr.mip & hart.csr.mie;
    if pending == 0 {
        return None;
    }

    let mie_enabled = hart.csr.mstatus & MSTATUS_MIE != 0;
    let sie_enabled = hart.csr.mstatus & MSTATUS_SIE != 0;

    let m_enabled = hart.priv_level < PrivilegeLevel::Machine
        || (hart.priv_level == PrivilegeLevel::Machine && mie_enabled);
    let s_enabled = hart.priv_level < PrivilegeLevel::Supervisor
        || (hart.priv_level == PrivilegeLevel::Supervisor && sie_enabled);

    let m_interrupts = pending & !hart.csr.mideleg;
    if m_enabled && m_interrupts != 0 {
        if m_interrupts & MIP_MEIP != 0 {
            return Some(Trap::MachineExternalInterrupt);
        }
        if m_interrupts & MIP_MSIP != 0 {
            return Some(Trap::MachineSoftwareInterrupt);
        }
        if m_interrupts & MIP_MTIP != 0 {
            return Some(Trap::MachineTimerInterrupt);
        }
        if m_interrupts & MIP_SEIP != 0 {
            return Some(Trap::SupervisorExternalInterrupt);
        }
        if m_interrupts & MIP_SSIP != 0 {
            return Some(Trap::SupervisorSoftwareInterrupt);
        }
        if m_interrupts & MIP_STIP != 0 {
            return Some(Trap::SupervisorTimerInterrupt);
        }
    }

    let s_interrupts = pending & hart.csr.mideleg;
    if s_enabled && s_interrupts != 0 {
        if s_interrupts & MIP_SEIP != 0 {
            return Some(Trap::SupervisorExternalInterrupt);
        }
        if s_interrupts & MIP_SSIP != 0 {
            return Some(Trap::SupervisorSoftwareInterrupt);
        }
        if s_interrupts & MIP_STIP != 0 {
            return Some(Trap::SupervisorTimerInterrupt);
        }
    }

    None
}

/// Deliver a trap: write cause/epc/tval, stack the interrupt-enable bits,
/// raise the privilege and vector the PC. The hart's PC must still point at
/// the trapping instruction (or the interrupted one).
pub fn deliver(hart: &mut Hart, trap: Trap) {
    let xlen = hart.xlen;
    let cause = trap.code(xlen);
    let tval = trap.value();
    let is_interrupt = trap.is_interrupt();

    let deleg = if is_interrupt { hart.csr.mideleg } else { hart.csr.medeleg };
    let bit = trap.cause();
    let delegate_to_s = hart.priv_level <= PrivilegeLevel::Supervisor
        && bit < 64
        && deleg & (1u64 << bit) != 0;

    log::trace!(
        "hart{}: trap {:?} at pc={:#x} -> {}",
        hart.id,
        trap,
        hart.pc,
        if delegate_to_s { "S" } else { "M" }
    );

    if delegate_to_s {
        hart.csr.sepc = hart.pc;
        hart.csr.scause = cause;
        hart.csr.stval = tval;

        let mut status = hart.csr.mstatus;
        if status & MSTATUS_SIE != 0 {
            status |= MSTATUS_SPIE;
        } else {
            status &= !MSTATUS_SPIE;
        }
        if hart.priv_level == PrivilegeLevel::Supervisor {
            status |= MSTATUS_SPP;
        } else {
            status &= !MSTATUS_SPP;
        }
        status &= !MSTATUS_SIE;
        hart.csr.mstatus = status;

        hart.set_priv(PrivilegeLevel::Supervisor);
        hart.pc = trap_vector(hart.csr.stvec, cause, is_interrupt, xlen);
    } else {
        hart.csr.mepc = hart.pc;
        hart.csr.mcause = cause;
        hart.csr.mtval = tval;

        let mut status = hart.csr.mstatus;
        if status & MSTATUS_MIE != 0 {
            status |= MSTATUS_MPIE;
        } else {
            status &= !MSTATUS_MPIE;
        }
        status = (status & !MSTATUS_MPP) | ((hart.priv_level as u64) << 11);
        status &= !MSTATUS_MIE;
        hart.csr.mstatus = status;

        hart.set_priv(PrivilegeLevel::Machine);
        hart.pc = trap_vector(hart.csr.mtvec, cause, is_interrupt, xlen);
    }

    // Any trap invalidates an outstanding LR reservation.
    hart.clear_reservation();
}

fn trap_vector(tvec: u64, cause: u64, is_interrupt: bool, xlen: Xlen) -> u64 {
    let base = tvec & !3;
    if tvec & 3 == 1 && is_interrupt {
        base + 4 * (cause & !interrupt_bit(xlen))
    } else {
        base
    }
}

/// `mret`: return from an M-mode trap handler.
pub fn mret(hart: &mut Hart) {
    let mpp = (hart.csr.mstatus >> 11) & 3;
    hart.set_priv(PrivilegeLevel::from(mpp as u8));

    let mut status = hart.csr.mstatus;
    if status & MSTATUS_MPIE != 0 {
        status |= MSTATUS_MIE;
    } else {
        status &= !MSTATUS_MIE;
    }
    status |= MSTATUS_MPIE;
    status &= !MSTATUS_MPP;
    // Leaving M for a lower privilege drops the modify-privilege override.
    if mpp != PrivilegeLevel::Machine as u64 {
        status &= !MSTATUS_MPRV;
    }
    hart.csr.mstatus = status;
    hart.pc = hart.csr.mepc;
    hart.clear_reservation();
}

/// `sret`: return from an S-mode trap handler.
pub fn sret(hart: &mut Hart) {
    let spp = (hart.csr.mstatus >> 8) & 1;
    hart.set_priv(if spp == 1 { PrivilegeLevel::Supervisor } else { PrivilegeLevel::User });

    let mut status = hart.csr.mstatus;
    if status & MSTATUS_SPIE != 0 {
        status |= MSTATUS_SIE;
    } else {
        status &= !MSTATUS_SIE;
    }
    status |= MSTATUS_SPIE;
    status &= !MSTATUS_SPP;
    status &= !MSTATUS_MPRV;
    hart.csr.mstatus = status;
    hart.pc = hart.csr.sepc;
    hart.clear_reservation();
}
