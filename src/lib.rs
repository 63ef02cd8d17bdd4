//! Compilador de un subconjunto de Pascal a ensamblador NASM x86
//! de 32 bits.
//!
//! El pipeline es síncrono y de una sola pasada por etapa:
//! - `lex` descompone el texto fuente en tokens ubicados.
//! - `symbols` mantiene la tabla de símbolos de dos niveles y la
//!   maquinaria de tipos (stubs, layout de records, subrangos).
//! - `parse` construye un AST tipado, desazucarando bucles y
//!   plegando constantes, coerciones y accesos a arreglos/records.
//! - `codegen` recorre el AST y emite el listado NASM, con sus
//!   administradores de registros, temporales y literales.
//! - `error` acumula diagnósticos de usuario sin detener la
//!   compilación.
//!
//! El ensamblado y enlazado posteriores, así como la librería de
//! runtime cuyos símbolos se invocan, son colaboradores externos.

pub mod codegen;
pub mod error;
pub mod lex;
pub mod parse;
pub mod source;
pub mod symbols;

use std::io::Write;

/// Compila un programa completo y escribe el listado en `output`.
///
/// Los errores de usuario no interrumpen: se devuelven como
/// diagnósticos junto con el listado de mejor esfuerzo. Solo los
/// errores del generador (agotamiento de registros, invariantes
/// rotas) cortan la emisión.
pub fn compile<W: Write>(
    source: &str,
    name: &str,
    debug: bool,
    output: W,
) -> Result<error::Diagnostics, codegen::GenError> {
    let parsed = parse::Parser::new(source, name).parse();
    let generator = codegen::CodeGen::new(&parsed.symbols, parsed.labels, output, debug);
    generator.write(&parsed.ast)?;
    Ok(parsed.diagnostics)
}
