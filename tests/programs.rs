//! Compila programas completos y verifica propiedades estructurales
//! del listado emitido.

use std::collections::HashMap;

use pascual::compile;

fn emit(source: &str) -> String {
    let mut output = Vec::new();
    let diagnostics =
        compile(source, "<test>", false, &mut output).expect("code generation failed");
    assert!(diagnostics.is_empty(), "diagnostics:\n{}", diagnostics);
    String::from_utf8(output).unwrap()
}

/// Parte de código de una línea, sin el comentario.
fn code_of(line: &str) -> &str {
    line.split(';').next().unwrap().trim()
}

/// Todo `push` de paso de argumentos (y todo real bajado con `fstp`
/// a `[esp]`) debe quedar saldado por un `add esp, N` explícito.
fn assert_balanced_stack(asm: &str) {
    let mut pushed = 0u32;
    let mut cleared = 0u32;

    for line in asm.lines() {
        let code = code_of(line);
        if let Some(operand) = code.strip_prefix("push") {
            let operand = operand.trim();
            // push ebp es el prólogo; push eax preserva y se salda con pop
            if operand != "ebp" && operand != "eax" {
                pushed += 4;
            }
        } else if code.starts_with("fstp") && code.contains("[esp]") {
            pushed += 4;
        } else if let Some(rest) = code.strip_prefix("add") {
            if let Some(amount) = rest.trim().strip_prefix("esp,") {
                cleared += amount.trim().parse::<u32>().unwrap();
            }
        }
    }

    assert_eq!(
        pushed, cleared,
        "argument pushes ({}) and esp cleanup ({}) disagree:\n{}",
        pushed, cleared, asm
    );
}

/// Ninguna instrucción puede tener dos operandos de memoria.
fn assert_no_double_memory(asm: &str) {
    for line in asm.lines() {
        let code = code_of(line);
        assert!(
            code.matches('[').count() <= 1,
            "two memory operands in: {}",
            line
        );
    }
}

/// Cada etiqueta se define exactamente una vez y todo salto apunta a
/// una etiqueta definida.
fn assert_labels_consistent(asm: &str) {
    let mut defined: HashMap<&str, usize> = HashMap::new();
    let mut referenced: Vec<&str> = Vec::new();

    for line in asm.lines() {
        let code = code_of(line);
        if let Some(label) = code.strip_suffix(':') {
            if !label.contains(' ') {
                *defined.entry(label).or_default() += 1;
            }
        }

        let mut parts = code.split_whitespace();
        if let Some(instr) = parts.next() {
            let is_jump = instr == "jmp" || (instr.starts_with('j') && instr.len() <= 3);
            if is_jump {
                referenced.push(parts.next().expect("jump without target"));
            }
        }
    }

    for (label, count) in &defined {
        assert_eq!(*count, 1, "label {} defined {} times", label, count);
    }
    for target in referenced {
        assert!(
            defined.contains_key(target),
            "jump to undefined label {}:\n{}",
            target,
            asm
        );
    }
}

fn assert_well_formed(asm: &str) {
    assert_balanced_stack(asm);
    assert_no_double_memory(asm);
    assert_labels_consistent(asm);
}

#[test]
fn integer_for_loop_prints_stars() {
    let asm = emit(
        "program p(output); var i,lim:integer; \
         begin lim:=7; for i:=0 to lim do writeln('*') end.",
    );
    assert_well_formed(&asm);

    assert!(asm.contains("%include \"pascal.inc\""));
    assert!(asm.contains("    global _asm_main"));
    assert!(asm.contains("_asm_main:"));
    // dos enteros en el frame
    assert!(asm.contains("sub     esp, 8"));
    // la condición del for es i <= lim
    assert!(asm.contains("jle     THEN_CLAUSE"));
    assert!(asm.contains("; no else branch"));
    assert!(asm.contains("call    _writeln"));
    assert!(asm.contains("jmp     L0"));
    assert!(asm.contains("L0:"));
    assert!(asm.contains("segment .data"));
    assert!(asm.contains("STRING0 db \"*\", 0"));
    assert!(asm.contains("segment .bss"));
}

#[test]
fn real_arithmetic_coerces_the_integer_side() {
    let asm = emit(
        "program p(output); var x:real; i:integer; \
         begin x := 1; i := 2; x := x + i; writeln(x) end.",
    );
    assert_well_formed(&asm);

    // el CASTREAL de i sube el entero con fild
    assert!(asm.contains("fild"));
    assert!(asm.contains("faddp   st1"));
    // el resultado real se guarda desde st0
    assert!(asm.contains("fstp"));
    // writeln(x) con x real llama al trampolín de 32 bits
    assert!(asm.contains("call    _writelnf32"));
}

#[test]
fn real_expression_arguments_descend_from_the_fpu_stack() {
    let asm = emit(
        "program p(output); var x:real; \
         begin x := 1.5; writeln(x + x) end.",
    );
    assert_well_formed(&asm);

    // el argumento queda en st0 y baja directo al stack de llamada
    assert!(asm.contains("faddp   st1"));
    assert!(asm.contains("fstp    dword [esp]"));
    assert!(asm.contains("call    _writelnf32"));
}

#[test]
fn record_and_pointer_round_trip() {
    let asm = emit(
        "program p(output); type pp=^person; person=record age:integer end; \
         var q:pp; begin new(q); q^.age := 41; writeln(q^.age) end.",
    );
    assert_well_formed(&asm);

    // new(q) se redujo a q := new(4): el record mide 4 bytes
    assert!(asm.contains("push    4"));
    assert!(asm.contains("call    _new"));
    // el campo age se escribe tras dereferenciar q
    assert!(asm.contains(", 41"));
    assert!(asm.contains("call    _writelni"));
}

#[test]
fn while_loop_repeats_the_body() {
    let asm = emit(
        "program p(output); var i:integer; \
         begin i:=0; while i<3 do begin writeln('x'); i:=i+1 end end.",
    );
    assert_well_formed(&asm);

    assert!(asm.contains("L0:"));
    assert!(asm.contains("jl      THEN_CLAUSE"));
    assert!(asm.contains("jmp     L0"));
    assert!(asm.contains("call    _writeln"));
    assert!(asm.contains("STRING0 db \"x\", 0"));
}

#[test]
fn forward_declared_pointer_record_compiles_clean() {
    let asm = emit(
        "program p(output); type pp=^node; node=record next: pp end; \
         var q:pp; begin new(q) end.",
    );
    assert_well_formed(&asm);
    assert!(asm.contains("call    _new"));
}

#[test]
fn distinct_constants_are_listed_once() {
    let asm = emit(
        "program p(output); begin writeln('*'); writeln('*'); writeln('x') end.",
    );
    assert_well_formed(&asm);

    assert_eq!(asm.matches("STRING0 db \"*\", 0").count(), 1);
    assert_eq!(asm.matches("STRING1 db \"x\", 0").count(), 1);
    assert!(!asm.contains("STRING2"));
}

#[test]
fn real_to_integer_assignment_uses_a_temp_slot() {
    let asm = emit(
        "program p(output); var x:real; i:integer; \
         begin x := 2.5; i := x end.",
    );
    assert_well_formed(&asm);

    assert!(asm.contains("FLOAT0 dd 2.5"));
    assert!(asm.contains("fistp   dword [TMP_4_0]"));
    assert!(asm.contains("TMP_4_0 resb 4"));
}

#[test]
fn registers_survive_a_long_run_of_statements() {
    // Cada sentencia libera sus registros; ocho escrituras seguidas
    // no deben agotar el archivo de registros
    let asm = emit(
        "program p(output); var i:integer; \
         begin i:=1; writeln(i); writeln(i); writeln(i); writeln(i); \
         writeln(i); writeln(i); writeln(i); writeln(i) end.",
    );
    assert_well_formed(&asm);
    assert_eq!(asm.matches("call    _writelni").count(), 8);
}

#[test]
fn else_branch_is_emitted_before_the_then_clause() {
    let asm = emit(
        "program p(output); var i:integer; \
         begin if i = 0 then i := 1 else i := 2 end.",
    );
    assert_well_formed(&asm);

    assert!(asm.contains("je      THEN_CLAUSE0"));
    let else_at = asm.find(", 2").expect("else branch missing");
    let then_at = asm.find("THEN_CLAUSE0:").expect("then label missing");
    assert!(else_at < then_at, "else branch must precede the then label");
}

#[test]
fn goto_and_user_labels_share_the_index_space() {
    let asm = emit(
        "program p(output); label 10; var i:integer; \
         begin i := 0; 10: i := i + 1; if i < 3 then goto 10 end.",
    );
    assert_well_formed(&asm);

    assert!(asm.contains("L0:"));
    assert!(asm.contains("jmp     L0"));
}

#[test]
fn epilogue_returns_zero() {
    let asm = emit("program p(output); begin end.");
    assert_well_formed(&asm);

    assert!(asm.contains("mov     eax, 0"));
    assert!(asm.contains("mov     esp, ebp"));
    assert!(asm.contains("pop     ebp"));
    assert!(asm.contains("    ret"));
}

#[test]
fn debug_mode_dumps_ast_and_symbols_as_comments() {
    let mut output = Vec::new();
    let diagnostics = compile(
        "program p(output); var i:integer; begin i := 1 end.",
        "<test>",
        true,
        &mut output,
    )
    .expect("code generation failed");
    assert!(diagnostics.is_empty());

    let asm = String::from_utf8(output).unwrap();
    assert!(asm.contains("; (PROGRAM p"));
    assert!(asm.contains("; Symbol Table Level Zero:"));
    assert!(asm.contains("; Symbol Table Level One:"));
    assert!(asm.contains("; genCode() for"));
    assert!(asm.contains("; genExpr() for"));
}

#[test]
fn parse_errors_do_not_stop_emission() {
    let mut output = Vec::new();
    let diagnostics = compile(
        "program p(output); type integer = real; var i:integer; begin i := 1 end.",
        "<test>",
        false,
        &mut output,
    )
    .expect("code generation failed");

    assert!(!diagnostics.is_empty());
    let asm = String::from_utf8(output).unwrap();
    assert!(asm.contains("_asm_main:"));
}
