use std::cell::RefCell;
use std::rc::Rc;

use crate::assembler::gprintf::{gprintf_string, print_gprintfs};
use crate::assembler::{Assembler, ByteCode, Error, Host, DEFAULT_START_ADDRESS};

fn assemble(source: &str) -> Assembler {
    let mut asm = Assembler::new();
    asm.assemble("test.vasm", source, DEFAULT_START_ADDRESS)
        .unwrap();
    asm
}

fn assemble_err(source: &str) -> Error {
    let mut asm = Assembler::new();
    asm.assemble("test.vasm", source, DEFAULT_START_ADDRESS)
        .unwrap_err()
}

fn data_bytes(asm: &Assembler) -> Vec<u8> {
    asm.byte_code().iter().map(|byte| byte.data).collect()
}

#[test]
fn equate_operand() {
    let asm = assemble("value EQU 0x42\n      LDI value\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x42]);
    assert!(asm.byte_code()[0].is_custom_address);
    assert_eq!(asm.byte_code()[0].address, 0x0200);
}

#[test]
fn forward_branch() {
    let asm = assemble("      BRA target\n      LDI 0\ntarget: LDI 1\n");
    // target sits at 0x0204, branches emit low byte minus two
    assert_eq!(data_bytes(&asm), vec![0x90, 0x02, 0x59, 0x00, 0x59, 0x01]);
    let target = asm.labels().iter().find(|l| l.name == "target").unwrap();
    assert_eq!(target.address, 0x0204);
}

#[test]
fn conditional_branch_family() {
    let asm = assemble("      LDI 0\nloop: BEQ loop\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x00, 0x35, 0x3F, 0x00]);
}

#[test]
fn native_store_post_increment() {
    // .ST [Y,X++],OUT packs bus and address mode into 0xDE
    let asm = assemble("      .ST [Y,X++],OUT\n");
    assert_eq!(data_bytes(&asm), vec![0xDE, 0x00]);
    assert!(asm.byte_code().iter().all(|byte| byte.is_rom_address));
}

#[test]
fn native_nop_without_operand() {
    let asm = assemble("      .NOP\n");
    assert_eq!(data_bytes(&asm), vec![0x02, 0x00]);
}

#[test]
fn call_table_deduplication() {
    let asm = assemble(
        "_callTable_ EQU 0x007E\n      CALL foo\n      CALL foo\nfoo:  RET\n",
    );
    // both calls share one slot at 0x007E/0x007F holding foo's address
    assert_eq!(
        data_bytes(&asm),
        vec![0xCF, 0x7E, 0xCF, 0x7E, 0xFF, 0x04, 0x02]
    );
    assert_eq!(asm.call_table_entries().len(), 1);
    assert_eq!(asm.call_table_entries()[0].operand, 0x7E);
    assert_eq!(asm.call_table_entries()[0].address, 0x0204);

    let table_low = &asm.byte_code()[5];
    assert!(table_low.is_custom_address);
    assert_eq!(table_low.address, 0x007E);
}

#[test]
fn call_table_grows_downwards() {
    let asm = assemble(
        "_callTable_ EQU 0x007E\n      CALL foo\n      CALL bar\nfoo:  RET\nbar:  RET\n",
    );
    assert_eq!(asm.call_table_entries()[0].operand, 0x7E);
    assert_eq!(asm.call_table_entries()[1].operand, 0x7C);
    // slots emit in reverse allocation order so addresses ascend
    let table: Vec<&ByteCode> = asm.byte_code()[6..].iter().collect();
    assert_eq!(table[0].address, 0x007C);
    assert!(table[0].is_custom_address);
    assert_eq!(table[0].data, 0x05); // bar 0x0205
    assert_eq!(table[1].data, 0x02);
    assert_eq!(table[2].address, 0x007E);
    assert!(!table[2].is_custom_address);
    assert_eq!(table[2].data, 0x04); // foo 0x0204
}

#[test]
fn call_without_table_resolves_directly() {
    let asm = assemble("      CALL foo\nfoo:  RET\n");
    assert_eq!(data_bytes(&asm), vec![0xCF, 0x02, 0xFF]);
    assert!(asm.call_table_entries().is_empty());
}

#[test]
fn macro_hygiene() {
    let asm = assemble(
        "%MACRO twice\nloop: LDI 0\n      BRA loop\n%ENDM\n      twice\n      twice\n",
    );
    assert_eq!(
        data_bytes(&asm),
        vec![0x59, 0x00, 0x90, 0xFE, 0x59, 0x00, 0x90, 0x02]
    );
    assert!(asm.labels().iter().any(|l| l.name == "loop0"));
    assert!(asm.labels().iter().any(|l| l.name == "loop1"));
}

#[test]
fn macro_parameters_and_invocation_label() {
    let asm = assemble(
        "%MACRO addconst n\n      ADDI n\n%ENDM\nstart addconst 3\n      BRA start\n",
    );
    assert_eq!(data_bytes(&asm), vec![0xE3, 0x03, 0x90, 0xFE]);
    assert_eq!(asm.labels()[0].name, "start");
    assert_eq!(asm.labels()[0].address, 0x0200);
}

#[test]
fn page_boundary_crossing_fails() {
    let err = assemble_err("_startAddress_ EQU 0x02FF\n      LDI 5\n");
    match err {
        Error::PageBoundary {
            old_address,
            new_address,
            ..
        } => {
            assert_eq!(old_address, 0x02FF);
            assert_eq!(new_address, 0x0300);
        }
        other => panic!("expected page boundary error, got {:?}", other),
    }
}

#[test]
fn data_pseudo_ops() {
    let asm = assemble("      DW 0x1234 0x5678\n");
    assert_eq!(data_bytes(&asm), vec![0x34, 0x12, 0x78, 0x56]);

    let asm = assemble("      DB 'AB' 0x43\n");
    assert_eq!(data_bytes(&asm), vec![0x41, 0x42, 0x43]);

    let asm = assemble("      DBR 1 2\n");
    assert_eq!(data_bytes(&asm), vec![1, 2]);
    assert!(asm.byte_code().iter().all(|byte| byte.is_rom_address));

    let asm = assemble("      DB 5 ; tail comment\n");
    assert_eq!(data_bytes(&asm), vec![5]);
}

#[test]
fn data_sizes_shift_labels() {
    let asm = assemble("      DB 1 2 3\nafter: RET\n");
    let after = asm.labels().iter().find(|l| l.name == "after").unwrap();
    assert_eq!(after.address, 0x0203);
    assert_eq!(data_bytes(&asm), vec![1, 2, 3, 0xFF]);
}

#[test]
fn equate_reused_as_label_restarts_emission() {
    let asm = assemble("vars EQU 0x0030\n      LDI 1\nvars  DB 7 8\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x01, 0x07, 0x08]);
    let segment = &asm.byte_code()[2];
    assert!(segment.is_custom_address);
    assert_eq!(segment.address, 0x0030);
    let vars = asm.labels().iter().find(|l| l.name == "vars").unwrap();
    assert_eq!(vars.address, 0x0030);
}

#[test]
fn label_alone_on_a_line() {
    let asm = assemble("      LDI 0\nalone\n      RET\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x00, 0xFF]);
    let alone = asm.labels().iter().find(|l| l.name == "alone").unwrap();
    assert_eq!(alone.address, 0x0202);
}

#[test]
fn address_directive_on_its_own_line() {
    let asm = assemble("vars EQU 0x0030\n      LDI 1\nvars\n      DB 7 8\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x01, 0x07, 0x08]);
    let segment = &asm.byte_code()[2];
    assert!(segment.is_custom_address);
    assert_eq!(segment.address, 0x0030);
}

#[test]
fn expression_operands() {
    let asm = assemble("value EQU 0x1000\n      LDWI value+0x234\n");
    assert_eq!(data_bytes(&asm), vec![0x11, 0x34, 0x12]);

    let asm = assemble("      LDI 2*3+1\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x07]);
}

#[test]
fn chained_equates() {
    let asm = assemble("a EQU 0x21\nb EQU a\n      LDI b\n");
    assert_eq!(data_bytes(&asm), vec![0x59, 0x21]);
}

#[test]
fn start_address_equate_moves_origin() {
    let asm = assemble("_startAddress_ EQU 0x0800\n      LDI 0\n");
    assert_eq!(asm.start_address(), 0x0800);
    assert_eq!(asm.byte_code()[0].address, 0x0800);
}

#[test]
fn reserved_equates_are_not_stored() {
    // a reserved equate configures the assembly but is not a symbol
    let err = assemble_err("_callTable_ EQU 0x007E\n      LDI _callTable_\n");
    assert!(matches!(err, Error::Unresolved { .. }));
}

#[test]
fn forced_page_segmentation() {
    let mut source = String::from("_startAddress_ EQU 0x0800\n");
    for i in 0..300 {
        source.push_str(&format!("      DB {}\n", i & 0xFF));
    }
    let asm = assemble(&source);
    assert_eq!(asm.byte_code().len(), 300);
    // data crossing a page multiple starts a fresh segment
    let forced = &asm.byte_code()[256];
    assert!(forced.is_custom_address);
    assert_eq!(forced.address, 0x0900);
    assert!(asm.byte_code()[1..256]
        .iter()
        .all(|byte| !byte.is_custom_address));
}

#[test]
fn byte_stream_rewinds_after_draining() {
    let mut asm = assemble("      LDI 1\n");
    let mut count = 0;
    while asm.next_assembled_byte().is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
    // the cursor rewound, the stream reads again from the start
    assert_eq!(asm.next_assembled_byte().unwrap().data, 0x59);
}

#[test]
fn errors_carry_position() {
    match assemble_err("      FROB 1\n") {
        Error::BadOpcode { file, line_number, .. } => {
            assert_eq!(file, "test.vasm");
            assert_eq!(line_number, 1);
        }
        other => panic!("expected bad opcode, got {:?}", other),
    }

    assert!(matches!(
        assemble_err("value EQU 1\nvalue EQU 2\n"),
        Error::Duplicate { .. }
    ));
    assert!(matches!(
        assemble_err("dup: RET\ndup: RET\n"),
        Error::Duplicate { .. }
    ));
    assert!(matches!(
        assemble_err("_startAddress_ LDI 0\n"),
        Error::Reserved { .. }
    ));
    assert!(matches!(
        assemble_err("      LDI nosuch\n"),
        Error::Unresolved { .. }
    ));
    assert!(matches!(
        assemble_err("      LDI\n"),
        Error::MissingOperand { .. }
    ));
    assert!(matches!(
        assemble_err("      .LD [Q,X]\n"),
        Error::BadNativeOperand { .. }
    ));
}

#[test]
fn include_files_assemble_in_place() {
    let dir = std::env::temp_dir();
    let path = dir.join("gtasm_test_include.i");
    std::fs::write(&path, "five EQU 5\n").unwrap();

    let source = format!("%include \"{}\"\n      LDI five\n", path.display());
    let asm = assemble(&source);
    assert_eq!(data_bytes(&asm), vec![0x59, 0x05]);
}

#[test]
fn include_errors_name_the_include_file() {
    let dir = std::env::temp_dir();
    let path = dir.join("gtasm_test_bad_include.i");
    std::fs::write(&path, "\n      FROB 1\n").unwrap();

    let source = format!("%include \"{}\"\n", path.display());
    match assemble_err(&source) {
        Error::BadOpcode { file, line_number, .. } => {
            assert!(file.ends_with("gtasm_test_bad_include.i"));
            assert_eq!(line_number, 2);
        }
        other => panic!("expected bad opcode, got {:?}", other),
    }
}

#[test]
fn gprintf_resolves_and_renders() {
    let asm = assemble(
        "count EQU 0x30\n      LDI 0\n      gprintf(\"n=%d x=%04x\", *count, count)\n      LDI 1\n",
    );
    let gprintfs = asm.gprintfs();
    assert_eq!(gprintfs.len(), 1);
    // registered at the address of the following instruction
    assert_eq!(gprintfs[0].address, 0x0202);
    assert!(gprintfs[0].vars[0].indirect);
    assert_eq!(gprintfs[0].vars[0].data, 0x30);
    assert!(!gprintfs[0].vars[1].indirect);

    let ram = |address: u16| match address {
        0x30 => 7u8,
        0x31 => 0u8,
        _ => 0,
    };
    assert_eq!(gprintf_string(&gprintfs[0], &ram), "n=7 x=0030");
}

#[test]
fn gprintf_unresolved_variable_fails() {
    let err = assemble_err("      gprintf(\"%d\", nosuch)\n      LDI 0\n");
    assert!(matches!(err, Error::Unresolved { .. }));
}

#[test]
fn gprintf_fires_once_per_visit() {
    let mut asm = assemble("      LDI 0\n      gprintf(\"tick\")\n");
    // gprintf sits at 0x0202; vPC low/high live at 0x0016/0x0017
    let at_gprintf = |address: u16| match address {
        0x16 => 0x02u8,
        0x17 => 0x02u8,
        _ => 0,
    };
    let elsewhere = |_: u16| 0u8;

    print_gprintfs(&mut asm, &at_gprintf);
    assert!(asm.gprintfs()[0].displayed);
    print_gprintfs(&mut asm, &elsewhere);
    assert!(!asm.gprintfs()[0].displayed);
}

#[test]
fn passes_agree_on_addresses() {
    // every label matches the address of the instruction that follows it
    let asm = assemble(
        "      LDWI 0x1000\na:    LDI 0\nb:    DB 1 2\nc:    RET\n",
    );
    let find = |name: &str| asm.labels().iter().find(|l| l.name == name).unwrap().address;
    assert_eq!(find("a"), 0x0203);
    assert_eq!(find("b"), 0x0205);
    assert_eq!(find("c"), 0x0207);
    assert_eq!(data_bytes(&asm).len(), 8);
}

struct RecordingHost {
    calls: Rc<RefCell<Vec<(&'static str, u16)>>>,
}

impl Host for RecordingHost {
    fn disable_uploads(&mut self, disable: bool) {
        self.calls.borrow_mut().push(("uploads", disable as u16));
    }
    fn set_single_step_watch_address(&mut self, address: u16) {
        self.calls.borrow_mut().push(("watch", address));
    }
    fn set_cpu_usage_address_a(&mut self, address: u16) {
        self.calls.borrow_mut().push(("usage_a", address));
    }
    fn set_cpu_usage_address_b(&mut self, address: u16) {
        self.calls.borrow_mut().push(("usage_b", address));
    }
}

#[test]
fn reserved_equates_reach_the_host() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut asm = Assembler::new();
    asm.set_host(Box::new(RecordingHost {
        calls: calls.clone(),
    }));
    asm.assemble(
        "test.vasm",
        "_singleStepWatch_ EQU 0x0210\n_disableUpload_ EQU 1\n      LDI 0\n",
        DEFAULT_START_ADDRESS,
    )
    .unwrap();

    let calls = calls.borrow();
    // uploads re-enabled at the start of every assembly, then the equates
    assert_eq!(calls[0], ("uploads", 0));
    assert!(calls.contains(&("watch", 0x0210)));
    assert!(calls.contains(&("uploads", 1)));
}

#[test]
fn context_is_reusable_between_assemblies() {
    let mut asm = Assembler::new();
    asm.assemble("a.vasm", "      LDI 1\n", DEFAULT_START_ADDRESS)
        .unwrap();
    assert_eq!(asm.byte_code().len(), 2);
    asm.assemble("b.vasm", "      RET\n", DEFAULT_START_ADDRESS)
        .unwrap();
    assert_eq!(data_bytes(&asm), vec![0xFF]);
    assert!(asm.labels().is_empty());
}
