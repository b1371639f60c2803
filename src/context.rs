// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers
// Copyright (c) 2026 Corovisor Contributors

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The context switch primitive (§4.1).
//!
//! `switch(from, to)` saves callee-saved registers, the stack pointer, and
//! the return address into `from`'s register-save area, then restores the
//! same from `to` and resumes there. It never touches FP/SIMD registers,
//! TLS, or the signal mask -- the leaf is kept as narrow as possible so a
//! port to another architecture needs only this one module (§9 Design
//! Notes, "Context switch ABI").
//!
//! Grounded on the teacher's `context.rs` (`Context::swap` /
//! `initialize_call_frame` / per-arch `Registers`), ported from the
//! teacher's out-of-tree `rust_swap_registers` C object (built via a
//! `build.rs` + `gcc`) to an in-tree `core::arch::global_asm!` block, which
//! needs no external assembler or build script on stable Rust.

use std::mem;

/// Opaque per-coroutine register-save area.
///
/// On every supported architecture the only field the Rust side ever reads
/// or writes directly is the stack pointer: callee-saved general-purpose
/// registers are pushed/popped by the `switch` assembly itself and never
/// surface as named fields, the way `boost.context`'s `fcontext_t` works.
#[repr(C)]
#[derive(Debug)]
pub struct RegisterSaveArea {
    stack_pointer: usize,
}

impl RegisterSaveArea {
    /// An area with no saved state, for a coroutine struct that has not yet
    /// been seeded (a "main" coroutine's area is never read by `switch`,
    /// only ever written to).
    pub fn empty() -> RegisterSaveArea {
        RegisterSaveArea { stack_pointer: 0 }
    }
}

pub type TrampolineFn = extern "C" fn(usize) -> !;

/// Seed `area` so that the next [`switch`] into it lands in `trampoline`
/// with `arg` as its single argument, running on `stack_top` (one-past-the-
/// end of the usable region; the stack grows down from here).
///
/// # Safety
/// `stack_top` must point one byte past the high end of a valid, writable,
/// sufficiently large stack allocation that outlives the coroutine.
pub unsafe fn initialize_call_frame(
    area: &mut RegisterSaveArea,
    stack_top: *mut u8,
    trampoline: TrampolineFn,
    arg: usize,
) {
    arch::initialize_call_frame(area, stack_top, trampoline, arg)
}

/// Save the current callee-saved registers/SP/return-address into `from`,
/// load the same from `to`, and resume at `to`'s continuation.
///
/// # Safety
/// `to` must have been seeded by [`initialize_call_frame`], or must be the
/// save area of a coroutine previously suspended by a prior `switch` into
/// it. `from` must be a valid area to receive the current context -- every
/// call site passes the calling coroutine's own area, or its worker's
/// "main" area (§4.1's invariant).
pub unsafe fn switch(from: *mut RegisterSaveArea, to: *const RegisterSaveArea) {
    arch::swap(from, to)
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::{RegisterSaveArea, TrampolineFn};

    // System V AMD64 calling convention. `corovisor_swap(rdi = from, rsi =
    // to)` pushes the six callee-saved GPRs, stashes `rsp` into `*from`,
    // loads `rsp` from `*to`, pops the same six registers back, and `ret`s
    // -- landing either at the point of a previous `corovisor_swap` call
    // (resuming a parked coroutine) or at `corovisor_trampoline` (first
    // entry of a freshly created one).
    //
    // `corovisor_trampoline` is reached with r12 holding the trampoline's
    // `arg` and r14 holding the address of the Rust entry function; it
    // moves r12 into rdi (first integer argument) and tail-jumps into it.
    std::arch::global_asm!(
        ".intel_syntax noprefix",
        ".text",
        ".global corovisor_swap",
        "corovisor_swap:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        ".global corovisor_trampoline",
        "corovisor_trampoline:",
        "mov rdi, r12",
        "jmp r14",
        ".att_syntax",
    );

    extern "C" {
        fn corovisor_swap(from: *mut RegisterSaveArea, to: *const RegisterSaveArea);
        fn corovisor_trampoline();
    }

    pub unsafe fn swap(from: *mut RegisterSaveArea, to: *const RegisterSaveArea) {
        corovisor_swap(from, to)
    }

    pub unsafe fn initialize_call_frame(
        area: &mut RegisterSaveArea,
        stack_top: *mut u8,
        trampoline: TrampolineFn,
        arg: usize,
    ) {
        // 16-byte align, then leave room for the 7-slot initial frame
        // (retaddr + 6 callee-saved registers) the swap epilogue expects.
        let aligned = (stack_top as usize) & !0xf;
        let sp = (aligned as *mut usize).sub(7);

        // Layout popped by corovisor_swap, high to low:
        //   [sp+6] = retaddr  (corovisor_trampoline)
        //   [sp+5] = rbp      (0)
        //   [sp+4] = rbx      (0)
        //   [sp+3] = r12      (arg)
        //   [sp+2] = r13      (0, unused)
        //   [sp+1] = r14      (trampoline fn ptr)
        //   [sp+0] = r15      (0, unused)
        *sp.add(6) = corovisor_trampoline as usize;
        *sp.add(5) = 0; // rbp
        *sp.add(4) = 0; // rbx
        *sp.add(3) = arg; // r12
        *sp.add(2) = 0; // r13
        *sp.add(1) = trampoline as usize; // r14
        *sp.add(0) = 0; // r15

        area.stack_pointer = sp as usize;
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::{RegisterSaveArea, TrampolineFn};

    // AAPCS64: x19-x28 are callee-saved, plus fp (x29) and lr (x30). `sp` is
    // saved/restored explicitly. `corovisor_trampoline` receives its `arg`
    // in x19 and the entry function's address in x20, moves x19 into x0
    // (first integer argument), and tail-branches into it.
    std::arch::global_asm!(
        ".text",
        ".global corovisor_swap",
        "corovisor_swap:",
        "stp x19, x20, [sp, #-96]!",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "mov x2, sp",
        "str x2, [x0]",
        "ldr x2, [x1]",
        "mov sp, x2",
        "ldp x29, x30, [sp, #80]",
        "ldp x27, x28, [sp, #64]",
        "ldp x25, x26, [sp, #48]",
        "ldp x23, x24, [sp, #32]",
        "ldp x21, x22, [sp, #16]",
        "ldp x19, x20, [sp], #96",
        "ret",
        ".global corovisor_trampoline",
        "corovisor_trampoline:",
        "mov x0, x19",
        "br x20",
    );

    extern "C" {
        fn corovisor_swap(from: *mut RegisterSaveArea, to: *const RegisterSaveArea);
        fn corovisor_trampoline();
    }

    pub unsafe fn swap(from: *mut RegisterSaveArea, to: *const RegisterSaveArea) {
        corovisor_swap(from, to)
    }

    pub unsafe fn initialize_call_frame(
        area: &mut RegisterSaveArea,
        stack_top: *mut u8,
        trampoline: TrampolineFn,
        arg: usize,
    ) {
        let aligned = ((stack_top as usize) & !0xf) as *mut usize;
        // Mirror the 12-usize (96-byte) frame corovisor_swap's epilogue
        // expects: x19,x20,x21,x22,x23,x24,x25,x26,x27,x28,x29,x30 (lr).
        let sp = aligned.sub(12);

        for i in 0..12 {
            *sp.add(i) = 0;
        }
        *sp.add(0) = arg; // x19
        *sp.add(1) = trampoline as usize; // x20
        *sp.add(11) = corovisor_trampoline as usize; // x30 / lr

        area.stack_pointer = sp as usize;
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    compile_error!(
        "corovisor's context switch primitive is implemented only for x86_64 and aarch64; \
         porting to a new ISA means implementing only this module (§9 Design Notes)"
    );
}

#[allow(dead_code)]
fn _assert_pointer_sized() {
    let _ = mem::size_of::<RegisterSaveArea>();
}
