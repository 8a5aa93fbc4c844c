// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::pic::PIC_1_OFFSET;

/// One stub per remapped IRQ vector; each funnels into `irq::dispatch`,
/// which looks up the registered handler and sends the EOI afterwards.
macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            crate::irq::dispatch($irq);
        }
    };
}

irq_stub!(irq0_handler, 0);
irq_stub!(irq1_handler, 1);
irq_stub!(irq2_handler, 2);
irq_stub!(irq3_handler, 3);
irq_stub!(irq4_handler, 4);
irq_stub!(irq5_handler, 5);
irq_stub!(irq6_handler, 6);
irq_stub!(irq7_handler, 7);
irq_stub!(irq8_handler, 8);
irq_stub!(irq9_handler, 9);
irq_stub!(irq10_handler, 10);
irq_stub!(irq11_handler, 11);
irq_stub!(irq12_handler, 12);
irq_stub!(irq13_handler, 13);
irq_stub!(irq14_handler, 14);
irq_stub!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        // SAFETY: DOUBLE_FAULT_IST_INDEX refers to a stack configured in the
        // TSS by gdt::init(), which runs before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        let base = PIC_1_OFFSET;
        idt[base].set_handler_fn(irq0_handler);
        idt[base + 1].set_handler_fn(irq1_handler);
        idt[base + 2].set_handler_fn(irq2_handler);
        idt[base + 3].set_handler_fn(irq3_handler);
        idt[base + 4].set_handler_fn(irq4_handler);
        idt[base + 5].set_handler_fn(irq5_handler);
        idt[base + 6].set_handler_fn(irq6_handler);
        idt[base + 7].set_handler_fn(irq7_handler);
        idt[base + 8].set_handler_fn(irq8_handler);
        idt[base + 9].set_handler_fn(irq9_handler);
        idt[base + 10].set_handler_fn(irq10_handler);
        idt[base + 11].set_handler_fn(irq11_handler);
        idt[base + 12].set_handler_fn(irq12_handler);
        idt[base + 13].set_handler_fn(irq13_handler);
        idt[base + 14].set_handler_fn(irq14_handler);
        idt[base + 15].set_handler_fn(irq15_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", Cr2::read());
    println!("Error Code: {:?}", error_code);
    println!("{:#?}", stack_frame);
    // No demand paging: every page fault is a kernel bug.
    panic!("Page fault");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    println!("EXCEPTION: GENERAL PROTECTION FAULT");
    println!("Error Code: {:#x}", error_code);
    println!("{:#?}", stack_frame);
    panic!("General protection fault");
}
