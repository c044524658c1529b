use disasm_engine::{
    AddressSpace, Analysis, AreaProps, Error, Flags, Insn, OpType, Operand, Processor, Worklist,
    render, render_partial_around,
};

/// Toy RISC-ish processor: opcode 0x01 is a 5-byte call taking a 4-byte
/// little-endian target, opcode 0x02 is a 1-byte return. Everything else is
/// not an instruction.
struct ToyProcessor;

const CALL: u8 = 0x01;
const RET: u8 = 0x02;

impl Processor for ToyProcessor {
    fn ana(&mut self, space: &AddressSpace, cmd: &mut Insn) -> Result<usize, Error> {
        match space.get_byte(cmd.ea)? {
            CALL => {
                let target = space.get_data(cmd.ea + 1, 4)?;
                cmd.operands.push(Operand::near(target));
                cmd.size = 5;
            }
            RET => {
                cmd.size = 1;
            }
            _ => {
                cmd.size = 0;
            }
        }
        Ok(cmd.size)
    }

    fn emu(&mut self, space: &mut AddressSpace, queue: &mut Worklist, cmd: &mut Insn) -> bool {
        if let Some(op) = cmd.operands.first() {
            // Call: control continues both at the target and past the call.
            let target = op.addr;
            queue.push(cmd.ea + cmd.size as u64);
            queue.push(target);
            space.add_xref(cmd.ea, target, "c");
            space.make_auto_label(target);
        }
        true
    }

    fn out(&mut self, space: &AddressSpace, cmd: &mut Insn) {
        let text = match cmd.operands.first() {
            Some(op) => {
                let target = match space.get_label(op.addr) {
                    Some(label) => label,
                    None => format!("0x{:x}", op.addr),
                };
                format!("{:<8}{}", "call", target)
            }
            None => "ret".to_string(),
        };
        cmd.disasm = Some(text);
    }
}

fn toy_space(content: &[u8]) -> AddressSpace {
    let mut space = AddressSpace::new();
    space.add_area(0, 0xf, AreaProps {
        name: ".text".to_string(),
        access: "rwx".to_string(),
    });
    space.load_content(&mut &content[..], 0, None).unwrap();
    space
}

#[test]
fn test_recursive_discovery() {
    let mut space = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    let decoded = analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    assert_eq!(decoded, 2);
    assert!(analysis.is_finished());
    assert_eq!(space.get_flags(0).unwrap(), Flags::CODE);
    for addr in 1..5 {
        assert_eq!(space.get_flags(addr).unwrap(), Flags::CODE_CONT);
    }
    assert_eq!(space.get_flags(5).unwrap(), Flags::CODE);
    assert_eq!(space.get_unit_size(0).unwrap(), 5);

    let xrefs = space.get_xrefs(5).unwrap();
    assert_eq!(xrefs.get(&0).map(String::as_str), Some("c"));
    assert_eq!(space.get_label(5).unwrap(), "loc_00000005");
}

#[test]
fn test_rerunning_analysis_is_idempotent() {
    let mut space = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    analysis.add_entrypoint(0);
    let decoded = analysis.analyze(&mut space, &mut ToyProcessor, |_| {});
    assert_eq!(decoded, 2);
    assert_eq!(space.get_flags(0).unwrap(), Flags::CODE);
    assert_eq!(space.get_unit_size(0).unwrap(), 5);
}

#[test]
fn test_path_out_of_area_terminates_quietly() {
    // The call target 0x100 lies outside every area; the byte after the
    // call is not an instruction either.
    let mut space = toy_space(&[CALL, 0x00, 0x01, 0x00, 0x00]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    let decoded = analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    assert_eq!(decoded, 1);
    assert_eq!(space.get_flags(0).unwrap(), Flags::CODE);
    assert_eq!(space.get_flags(5).unwrap(), Flags::UNK);
    assert!(space.get_xrefs(0x100).is_some());
}

#[test]
fn test_truncated_instruction_at_area_end() {
    // A call opcode two bytes before the area end: ana() runs out of the
    // area reading the target and the path ends without marking code.
    let mut space = toy_space(&[RET; 16]);
    space.load_content(&mut &[CALL][..], 0xe, None).unwrap();
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0xe);
    let decoded = analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    assert_eq!(decoded, 0);
    assert_eq!(space.get_flags(0xe).unwrap(), Flags::UNK);
}

#[test]
fn test_progress_callback_cadence() {
    let mut space = AddressSpace::new();
    space.add_area(0, 0x9ff, AreaProps::default());
    space
        .load_content(&mut &vec![RET; 0xa00][..], 0, None)
        .unwrap();
    let mut analysis = Analysis::new();
    for ea in 0..2500 {
        analysis.add_entrypoint(ea);
    }

    let mut ticks = Vec::new();
    let decoded = analysis.analyze(&mut space, &mut ToyProcessor, |cnt| ticks.push(cnt));
    assert_eq!(decoded, 2500);
    assert_eq!(ticks, vec![1000, 2000]);
}

#[test]
fn test_render_after_analysis() {
    let mut space = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    analysis.analyze(&mut space, &mut ToyProcessor, |_| {});
    space.set_comment(5, "leaf");

    let mut model = render(&space, &mut ToyProcessor).unwrap();
    let lines: Vec<String> = (0..model.len())
        .map(|no| model.lines_mut()[no].render(&space).to_string())
        .collect();

    let mut expected = vec![
        "; Start of 0x0 area".to_string(),
        "call    loc_00000005".to_string(),
        "; xref: 0x0 c".to_string(),
        "loc_00000005:".to_string(),
        "ret  ; leaf".to_string(),
    ];
    expected.extend(std::iter::repeat_n("unk     0x00".to_string(), 10));
    expected.push("; End of 0x0 area".to_string());
    assert_eq!(lines, expected);

    assert_eq!(model.addr2line_no(0), Some(1));
    assert_eq!(model.addr2line_no(5), Some(4));
    assert_eq!(model.line_no(5, 0), Some(2));
    assert_eq!(model.line_no(5, 1), Some(3));

    // Follow-reference targets.
    let call_op = model.lines()[1].get_operand_addr().unwrap();
    assert_eq!(call_op.kind, OpType::Near);
    assert_eq!(call_op.addr, 5);
    let xref_op = model.lines()[2].get_operand_addr().unwrap();
    assert_eq!(xref_op.addr, 0);
    assert!(model.lines()[3].get_operand_addr().is_none());
}

#[test]
fn test_render_around_code_snaps_to_instruction_head() {
    let mut space = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    // Backing off from the ret lands mid-call; the renderer snaps to the
    // call's head so the window opens on whole units.
    let model = render_partial_around(&space, &mut ToyProcessor, 5, 0, 1).unwrap();
    let lineno = model.target_addr_lineno_0.unwrap();
    assert_eq!(model.lines()[lineno].ea, 5);
    assert_eq!(model.lines()[0].ea, 0);
    assert_eq!(model.addr2line_no(0), Some(1));
}

#[test]
fn test_persistence_round_trip() {
    let mut space = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    let mut analysis = Analysis::new();
    analysis.add_entrypoint(0);
    analysis.analyze(&mut space, &mut ToyProcessor, |_| {});

    space.set_label(0, "entry");
    space.set_comment(0, "program start");
    space.make_data(8, 2).unwrap();
    space.set_arg_prop(8, 0, disasm_engine::PROP_TYPE, serde_json::Value::from(2));

    let mut labels = Vec::new();
    let mut comments = Vec::new();
    let mut arg_props = Vec::new();
    let mut xrefs = Vec::new();
    let mut areas = Vec::new();
    space.save_labels(&mut labels).unwrap();
    space.save_comments(&mut comments).unwrap();
    space.save_arg_props(&mut arg_props).unwrap();
    space.save_xrefs(&mut xrefs).unwrap();
    space.save_areas(&mut areas).unwrap();

    let mut restored = toy_space(&[CALL, 0x05, 0x00, 0x00, 0x00, RET]);
    restored.load_labels(&mut &labels[..]).unwrap();
    restored.load_comments(&mut &comments[..]).unwrap();
    restored.load_arg_props(&mut &arg_props[..]).unwrap();
    restored.load_xrefs(&mut &xrefs[..]).unwrap();
    restored.load_areas(&mut &areas[..]).unwrap();

    // Saving the restored space reproduces the streams byte-exactly.
    let mut again = Vec::new();
    restored.save_labels(&mut again).unwrap();
    assert_eq!(again, labels);
    again.clear();
    restored.save_comments(&mut again).unwrap();
    assert_eq!(again, comments);
    again.clear();
    restored.save_arg_props(&mut again).unwrap();
    assert_eq!(again, arg_props);
    again.clear();
    restored.save_xrefs(&mut again).unwrap();
    assert_eq!(again, xrefs);
    again.clear();
    restored.save_areas(&mut again).unwrap();
    assert_eq!(again, areas);

    // And the two spaces render identically.
    let mut a = render(&space, &mut ToyProcessor).unwrap();
    let mut b = render(&restored, &mut ToyProcessor).unwrap();
    assert_eq!(a.len(), b.len());
    for no in 0..a.len() {
        assert_eq!(
            a.lines_mut()[no].render(&space),
            b.lines_mut()[no].render(&restored)
        );
    }
}
