//! Exception vectors and early CPU setup
//!
//! The platform bootloader enters the kernel at EL1 with interrupts
//! masked, SP set and BSS zeroed (boot contract), so all that remains
//! here is the exception vector table. Every vector saves the
//! caller-visible register file, calls into Rust, restores and erets;
//! only the IRQ vectors do real work.

use core::arch::global_asm;

global_asm!(
    r#"
.macro SAVE_AND_CALL handler
    sub     sp, sp, #256
    stp     x0, x1,   [sp, #0]
    stp     x2, x3,   [sp, #16]
    stp     x4, x5,   [sp, #32]
    stp     x6, x7,   [sp, #48]
    stp     x8, x9,   [sp, #64]
    stp     x10, x11, [sp, #80]
    stp     x12, x13, [sp, #96]
    stp     x14, x15, [sp, #112]
    stp     x16, x17, [sp, #128]
    stp     x18, x19, [sp, #144]
    stp     x20, x21, [sp, #160]
    stp     x22, x23, [sp, #176]
    stp     x24, x25, [sp, #192]
    stp     x26, x27, [sp, #208]
    stp     x28, x29, [sp, #224]
    str     x30,      [sp, #240]
    bl      \handler
    ldp     x0, x1,   [sp, #0]
    ldp     x2, x3,   [sp, #16]
    ldp     x4, x5,   [sp, #32]
    ldp     x6, x7,   [sp, #48]
    ldp     x8, x9,   [sp, #64]
    ldp     x10, x11, [sp, #80]
    ldp     x12, x13, [sp, #96]
    ldp     x14, x15, [sp, #112]
    ldp     x16, x17, [sp, #128]
    ldp     x18, x19, [sp, #144]
    ldp     x20, x21, [sp, #160]
    ldp     x22, x23, [sp, #176]
    ldp     x24, x25, [sp, #192]
    ldp     x26, x27, [sp, #208]
    ldp     x28, x29, [sp, #224]
    ldr     x30,      [sp, #240]
    add     sp, sp, #256
    eret
.endm

.balign 0x800
.global __exception_vectors
__exception_vectors:
    // Current EL with SP_EL0
    .balign 0x80
    SAVE_AND_CALL vibeos_sync_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_irq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_fiq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_serror_exception

    // Current EL with SP_ELx
    .balign 0x80
    SAVE_AND_CALL vibeos_sync_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_irq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_fiq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_serror_exception

    // Lower EL, AArch64 (unused: everything runs at EL1)
    .balign 0x80
    SAVE_AND_CALL vibeos_sync_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_irq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_fiq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_serror_exception

    // Lower EL, AArch32 (never taken)
    .balign 0x80
    SAVE_AND_CALL vibeos_sync_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_irq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_fiq_exception
    .balign 0x80
    SAVE_AND_CALL vibeos_serror_exception
"#
);

extern "C" {
    static __exception_vectors: u8;
}

/// Point VBAR_EL1 at the vector table.
pub fn install_vectors() {
    // SAFETY: the table above is 2 KiB aligned and every entry is a
    // complete save/call/restore/eret sequence.
    unsafe {
        let vbar = core::ptr::addr_of!(__exception_vectors) as u64;
        core::arch::asm!("msr VBAR_EL1, {}", "isb", in(reg) vbar);
    }
}

#[no_mangle]
extern "C" fn vibeos_irq_exception() {
    super::irq_dispatch();
}

#[no_mangle]
extern "C" fn vibeos_sync_exception() {
    let (esr, elr, far): (u64, u64, u64);
    // SAFETY: reading exception syndrome registers has no side effects.
    unsafe {
        core::arch::asm!(
            "mrs {0}, ESR_EL1",
            "mrs {1}, ELR_EL1",
            "mrs {2}, FAR_EL1",
            out(reg) esr, out(reg) elr, out(reg) far
        );
    }
    serial_println!(
        "[EXC] Sync exception: ESR={:#x} ELR={:#x} FAR={:#x}",
        esr,
        elr,
        far
    );
    crate::arch::halt();
}

#[no_mangle]
extern "C" fn vibeos_fiq_exception() {
    serial_println!("[EXC] Unexpected FIQ");
    crate::arch::halt();
}

#[no_mangle]
extern "C" fn vibeos_serror_exception() {
    serial_println!("[EXC] SError");
    crate::arch::halt();
}
