//! Tabla de símbolos y maquinaria de tipos.
//!
//! Los símbolos viven en una arena y se refieren entre sí por medio
//! de handles enteros ([`SymbolId`]), lo cual permite mutar stubs de
//! declaraciones adelantadas sin problemas de aliasing. La tabla
//! tiene dos niveles: el nivel cero contiene los tipos básicos y las
//! funciones integradas, y es inmutable; el nivel uno contiene todo
//! lo que define el programa compilado.
//!
//! Los tamaños y alineamientos se calculan sobre demanda a partir de
//! la arena, de manera que siempre reflejan los stubs ya resueltos.

use std::fmt::Write as _;

use thiserror::Error;

pub const INT_SIZE: u32 = 4;
pub const REAL_SIZE: u32 = 4;
pub const POINTER_SIZE: u32 = 4;
pub const BOOL_SIZE: u32 = 4;
pub const CHAR_SIZE: u32 = 1;

/// Handle de un símbolo dentro de la arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SymbolId(u32);

impl SymbolId {
    /// El tipo nulo centinela. Nunca se usa `Option` para tipos: los
    /// nodos sin tipo conocido apuntan aquí.
    pub const NULL: SymbolId = SymbolId(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Valor de una constante con tipo básico.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i32),
    Real(f64),
    Str(String),
    Bool(bool),
}

/// Una entrada de la tabla de símbolos.
#[derive(Clone, Debug)]
pub enum Symbol {
    /// Centinela para tipos desconocidos o ausentes.
    NullType,

    /// integer, real, char o boolean.
    Basic { name: &'static str, size: u32 },

    /// Declaración adelantada. El destino se fija exactamente una vez.
    Stub { name: String, target: SymbolId },

    Pointer { target: SymbolId },

    /// Intervalo cerrado de enteros, usado como dominio de índice de
    /// arreglos y como materialización de enumeraciones.
    Subrange { low: i32, high: i32 },

    Record { fields: Vec<SymbolId> },

    /// Campo de un record, con offset fijado al cerrar el record.
    Field { name: String, ty: SymbolId, offset: u32 },

    Array { index: SymbolId, elem: SymbolId },

    Var { name: String, ty: SymbolId, size: u32, offset: u32 },

    Const { name: String, ty: SymbolId, value: Literal },

    Function { name: String, result: SymbolId, args: Vec<SymbolId> },
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Cannot redefine built-in symbol '{0}'")]
    RedefineBuiltin(String),

    #[error("Cannot interpret type as a subrange for an array")]
    NotASubrange,
}

/// Redondea una dirección hacia arriba al múltiplo de `align`.
pub fn align_up(address: u32, align: u32) -> u32 {
    (address + align - 1) / align * align
}

/// Tipos básicos y funciones integradas conocidas por el generador.
pub struct SymbolTable {
    arena: Vec<Symbol>,
    level_zero: Vec<(String, SymbolId)>,
    level_one: Vec<(String, SymbolId)>,
    offset: u32,

    pub integer: SymbolId,
    pub real: SymbolId,
    pub chr: SymbolId,
    pub boolean: SymbolId,

    /// Tipo del literal `nil`: puntero a nada en particular.
    pub generic_pointer: SymbolId,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            arena: vec![Symbol::NullType],
            level_zero: Vec::new(),
            level_one: Vec::new(),
            offset: 0,
            integer: SymbolId::NULL,
            real: SymbolId::NULL,
            chr: SymbolId::NULL,
            boolean: SymbolId::NULL,
            generic_pointer: SymbolId::NULL,
        };

        table.real = table.install_builtin("real", Symbol::Basic { name: "real", size: REAL_SIZE });
        table.integer =
            table.install_builtin("integer", Symbol::Basic { name: "integer", size: INT_SIZE });
        table.chr = table.install_builtin("char", Symbol::Basic { name: "char", size: CHAR_SIZE });
        table.boolean =
            table.install_builtin("boolean", Symbol::Basic { name: "boolean", size: BOOL_SIZE });
        table.generic_pointer = table.alloc(Symbol::Pointer { target: SymbolId::NULL });

        let (integer, real, chr, boolean) =
            (table.integer, table.real, table.chr, table.boolean);
        let null = SymbolId::NULL;

        let builtins: &[(&str, SymbolId, SymbolId)] = &[
            ("exp", real, real),
            ("sin", real, real),
            ("cos", real, real),
            ("sqrt", real, real),
            ("round", real, real),
            ("iround", integer, real),
            ("ord", integer, real),
            ("new", integer, integer),
            ("write", null, chr),
            ("writeln", null, chr),
            ("writef", null, real),
            ("writelnf", null, real),
            ("writei", null, integer),
            ("writelni", null, integer),
            ("read", null, null),
            ("readln", null, null),
            ("eof", boolean, null),
        ];

        for &(name, result, arg) in builtins {
            table.install_builtin(
                name,
                Symbol::Function {
                    name: name.to_owned(),
                    result,
                    args: vec![arg],
                },
            );
        }

        table
    }

    fn install_builtin(&mut self, name: &str, symbol: Symbol) -> SymbolId {
        let id = self.alloc(symbol);
        self.level_zero.push((name.to_owned(), id));
        id
    }

    /// Reserva una entrada anónima en la arena.
    pub fn alloc(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.arena.len() as u32);
        self.arena.push(symbol);
        id
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.arena[id.index()]
    }

    /// Busca un nombre, primero en el nivel cero y luego en el uno.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.level_zero
            .iter()
            .chain(self.level_one.iter())
            .find(|(key, _)| key == name)
            .map(|&(_, id)| id)
    }

    pub fn in_level_zero(&self, name: &str) -> bool {
        self.level_zero.iter().any(|(key, _)| key == name)
    }

    /// Instala un símbolo con nombre en el nivel uno. Falla si el
    /// nombre pertenece al nivel cero.
    pub fn insert(&mut self, name: &str, symbol: Symbol) -> Result<SymbolId, SymbolError> {
        if self.in_level_zero(name) {
            return Err(SymbolError::RedefineBuiltin(name.to_owned()));
        }

        let id = self.alloc(symbol);
        self.level_one.push((name.to_owned(), id));
        Ok(id)
    }

    /// Instala una variable, asignando su offset dentro del área de
    /// variables: el offset es el actual alineado al tipo, y el total
    /// avanza por el tamaño alineado.
    pub fn install_variable(&mut self, name: &str, ty: SymbolId) -> Result<SymbolId, SymbolError> {
        let size = self.size_of(ty);
        let align = self.align_of(ty);
        let offset = align_up(self.offset, align);
        self.offset += align_up(size, align);

        self.insert(
            name,
            Symbol::Var {
                name: name.to_owned(),
                ty,
                size,
                offset,
            },
        )
    }

    /// Busca un nombre de tipo; si no existe todavía instala un stub
    /// con destino nulo. Así se admiten referencias adelantadas dentro
    /// de declaraciones de punteros.
    pub fn lookup_or_insert_type(&mut self, name: &str) -> SymbolId {
        match self.lookup(name) {
            Some(id) => id,
            None => {
                let id = self.alloc(Symbol::Stub {
                    name: name.to_owned(),
                    target: SymbolId::NULL,
                });
                self.level_one.push((name.to_owned(), id));
                id
            }
        }
    }

    /// Fija el destino de un stub. El llamador ya verificó que el
    /// destino actual sea nulo.
    pub fn set_stub_target(&mut self, stub: SymbolId, new_target: SymbolId) {
        match &mut self.arena[stub.index()] {
            Symbol::Stub { target, .. } => *target = new_target,
            other => panic!("set_stub_target on non-stub {:?}", other),
        }
    }

    /// Persigue stubs y campos hasta un tipo concreto. Los stubs sin
    /// resolver conducen al tipo nulo; los autorreferentes se cortan.
    pub fn resolve(&self, id: SymbolId) -> SymbolId {
        let mut current = id;
        loop {
            match self.get(current) {
                Symbol::Stub { target, .. } if *target != current => current = *target,
                Symbol::Field { ty, .. } => current = *ty,
                _ => return current,
            }
        }
    }

    /// Tamaño en bytes de un tipo.
    pub fn size_of(&self, id: SymbolId) -> u32 {
        match self.get(self.resolve(id)) {
            Symbol::NullType => 0,
            Symbol::Basic { size, .. } => *size,
            Symbol::Pointer { .. } => POINTER_SIZE,
            Symbol::Subrange { .. } => INT_SIZE,
            Symbol::Record { fields } => {
                let end = fields
                    .last()
                    .map(|&field| match self.get(field) {
                        Symbol::Field { ty, offset, .. } => offset + self.size_of(*ty),
                        _ => 0,
                    })
                    .unwrap_or(0);
                align_up(end, self.align_of(id).max(1))
            }
            Symbol::Array { index, elem } => self.interval(*index) * self.size_of(*elem),
            Symbol::Var { size, .. } => *size,
            Symbol::Const { ty, .. } => self.size_of(*ty),
            Symbol::Stub { .. } | Symbol::Field { .. } | Symbol::Function { .. } => 0,
        }
    }

    /// Alineamiento de un tipo: básicos a su tamaño, punteros a 4,
    /// arreglos a 8. Un record alinea a 8 si contiene algún campo
    /// compuesto, de lo contrario al mayor alineamiento de sus campos.
    pub fn align_of(&self, id: SymbolId) -> u32 {
        match self.get(self.resolve(id)) {
            Symbol::Basic { size, .. } => (*size).max(1),
            Symbol::Pointer { .. } => POINTER_SIZE,
            Symbol::Subrange { .. } => INT_SIZE,
            Symbol::Array { .. } => 8,
            Symbol::Record { fields } => {
                let mut align = 4;
                for &field in fields {
                    let ty = match self.get(field) {
                        Symbol::Field { ty, .. } => self.resolve(*ty),
                        _ => continue,
                    };
                    match self.get(ty) {
                        Symbol::Record { .. } | Symbol::Array { .. } => return 8,
                        _ => align = align.max(self.align_of(ty)),
                    }
                }
                align
            }
            _ => 4,
        }
    }

    /// Cantidad de valores en el dominio de un subrango.
    pub fn interval(&self, id: SymbolId) -> u32 {
        match self.get(self.resolve(id)) {
            Symbol::Subrange { low, high } => (high - low + 1).max(0) as u32,
            _ => 0,
        }
    }

    /// Cota inferior de un subrango.
    pub fn subrange_low(&self, id: SymbolId) -> i32 {
        match self.get(self.resolve(id)) {
            Symbol::Subrange { low, .. } => *low,
            _ => 0,
        }
    }

    /// Construye los campos de un record, asignando offsets: cada
    /// campo comienza en el fin del anterior alineado a su tipo.
    pub fn finalize_fields(&mut self, fields: Vec<(String, SymbolId)>) -> Vec<SymbolId> {
        let mut end = 0;
        let mut ids = Vec::with_capacity(fields.len());
        for (name, ty) in fields {
            let offset = align_up(end, self.align_of(ty).max(1));
            end = offset + self.size_of(ty);
            ids.push(self.alloc(Symbol::Field { name, ty, offset }));
        }
        ids
    }

    /// Construye un arreglo (posiblemente multidimensional) a partir
    /// de sus dominios de índice, de izquierda a derecha: el primer
    /// dominio queda en el arreglo exterior.
    pub fn make_array(
        &mut self,
        ranges: &[SymbolId],
        elem: SymbolId,
    ) -> Result<SymbolId, SymbolError> {
        let (&first, rest) = ranges.split_first().expect("empty range list");
        if !matches!(self.get(self.resolve(first)), Symbol::Subrange { .. }) {
            return Err(SymbolError::NotASubrange);
        }

        let elem = if rest.is_empty() {
            elem
        } else {
            self.make_array(rest, elem)?
        };

        Ok(self.alloc(Symbol::Array { index: first, elem }))
    }

    /// Busca un campo por nombre dentro de un record resuelto.
    pub fn record_field(&self, record: SymbolId, field_name: &str) -> Option<SymbolId> {
        match self.get(self.resolve(record)) {
            Symbol::Record { fields } => fields
                .iter()
                .find(|&&field| match self.get(field) {
                    Symbol::Field { name, .. } => name == field_name,
                    _ => false,
                })
                .copied(),
            _ => None,
        }
    }

    /// Tipo básico que corresponde a un literal.
    pub fn basic_of(&self, literal: &Literal) -> SymbolId {
        match literal {
            Literal::Int(_) => self.integer,
            Literal::Real(_) => self.real,
            Literal::Str(_) => self.chr,
            Literal::Bool(_) => self.boolean,
        }
    }

    /// Total de bytes reservados para variables.
    pub fn frame_size(&self) -> u32 {
        self.offset
    }

    /// Nombre con que se despliega un símbolo en los volcados.
    fn describe(&self, id: SymbolId) -> String {
        match self.get(id) {
            Symbol::NullType => "null type".to_owned(),
            Symbol::Basic { name, size } => format!("basic type {} size={}", name, size),
            Symbol::Stub { name, target } => {
                if target.is_null() || *target == id {
                    format!("stub {} -> ?", name)
                } else {
                    format!("stub {} -> {}", name, self.describe(*target))
                }
            }
            Symbol::Pointer { target } => {
                if target.is_null() {
                    "pointer".to_owned()
                } else {
                    format!("pointer to {}", self.describe(*target))
                }
            }
            Symbol::Subrange { low, high } => format!("subrange {}..{}", low, high),
            Symbol::Record { fields } => format!(
                "record size={} fields=[{}]",
                self.size_of(id),
                fields
                    .iter()
                    .map(|&f| self.describe(f))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Symbol::Field { name, offset, .. } => format!("{} offset={}", name, offset),
            Symbol::Array { index, elem } => format!(
                "array[{}] of {} size={}",
                self.describe(self.resolve(*index)),
                self.describe(self.resolve(*elem)),
                self.size_of(id),
            ),
            Symbol::Var { name, size, offset, .. } => {
                format!("var {} size={} offset={}", name, size, offset)
            }
            Symbol::Const { name, value, .. } => format!("const {} = {:?}", name, value),
            Symbol::Function { name, result, args } => format!(
                "function {}({}) -> {}",
                name,
                args.iter()
                    .map(|&a| self.describe(a))
                    .collect::<Vec<_>>()
                    .join(", "),
                self.describe(*result),
            ),
        }
    }

    /// Volcado legible de un nivel de la tabla, para el modo -d.
    pub fn level_dump(&self, level: usize) -> String {
        let (title, entries) = match level {
            0 => ("Symbol Table Level Zero:", &self.level_zero),
            _ => ("Symbol Table Level One:", &self.level_one),
        };

        let mut dump = String::from(title);
        for (name, id) in entries {
            let _ = write!(dump, "\n{:10} : {}", name, self.describe(*id));
        }
        dump
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_installed() {
        let table = SymbolTable::new();
        for name in ["integer", "real", "char", "boolean", "writeln", "new", "eof"] {
            assert!(table.lookup(name).is_some(), "missing builtin {}", name);
        }
        assert_eq!(table.size_of(table.integer), 4);
        assert_eq!(table.size_of(table.chr), 1);
    }

    #[test]
    fn builtins_cannot_be_redefined() {
        let mut table = SymbolTable::new();
        let result = table.insert(
            "integer",
            Symbol::Stub {
                name: "integer".to_owned(),
                target: SymbolId::NULL,
            },
        );
        assert!(matches!(result, Err(SymbolError::RedefineBuiltin(_))));
        assert!(matches!(
            table.get(table.lookup("integer").unwrap()),
            Symbol::Basic { name: "integer", .. }
        ));
    }

    #[test]
    fn field_offsets_respect_alignment() {
        let mut table = SymbolTable::new();
        let fields = table.finalize_fields(vec![
            ("c".to_owned(), table.chr),
            ("i".to_owned(), table.integer),
            ("d".to_owned(), table.chr),
        ]);
        let record = table.alloc(Symbol::Record { fields: fields.clone() });

        let offsets: Vec<u32> = fields
            .iter()
            .map(|&f| match table.get(f) {
                Symbol::Field { offset, .. } => *offset,
                _ => unreachable!(),
            })
            .collect();

        // char en 0, integer alineado a 4, char en 8; total acolchado a 4
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(table.size_of(record), 12);
    }

    #[test]
    fn scalar_record_is_not_padded_to_eight() {
        let mut table = SymbolTable::new();
        let fields = table.finalize_fields(vec![("age".to_owned(), table.integer)]);
        let record = table.alloc(Symbol::Record { fields });
        assert_eq!(table.size_of(record), 4);
        assert_eq!(table.align_of(record), 4);
    }

    #[test]
    fn composite_record_aligns_to_eight() {
        let mut table = SymbolTable::new();
        let range = table.alloc(Symbol::Subrange { low: 1, high: 3 });
        let array = table.make_array(&[range], table.integer).unwrap();
        let fields = table.finalize_fields(vec![
            ("tag".to_owned(), table.integer),
            ("data".to_owned(), array),
        ]);
        let record = table.alloc(Symbol::Record { fields: fields.clone() });

        assert_eq!(table.align_of(record), 8);
        // data alinea a 8: tag en 0, data en 8, total 8 + 12 -> 24
        match table.get(fields[1]) {
            Symbol::Field { offset, .. } => assert_eq!(*offset, 8),
            _ => unreachable!(),
        }
        assert_eq!(table.size_of(record), 24);
    }

    #[test]
    fn multidimensional_arrays_nest_left_to_right() {
        let mut table = SymbolTable::new();
        let outer = table.alloc(Symbol::Subrange { low: 1, high: 10 });
        let inner = table.alloc(Symbol::Subrange { low: 2, high: 5 });
        let array = table.make_array(&[outer, inner], table.integer).unwrap();

        // array[1..10, 2..5] of integer = 10 * (4 * 4)
        assert_eq!(table.size_of(array), 160);
        match table.get(array) {
            Symbol::Array { index, elem } => {
                assert_eq!(table.subrange_low(*index), 1);
                assert!(matches!(table.get(*elem), Symbol::Array { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn stub_resolution_chases_to_ground() {
        let mut table = SymbolTable::new();
        let stub = table.lookup_or_insert_type("person");
        assert!(table.resolve(stub).is_null());

        let fields = table.finalize_fields(vec![("x".to_owned(), table.integer)]);
        let record = table.alloc(Symbol::Record { fields });
        table.set_stub_target(stub, record);

        assert_eq!(table.resolve(stub), record);
        assert_eq!(table.size_of(stub), 4);
    }

    #[test]
    fn variable_offsets_advance_aligned() {
        let mut table = SymbolTable::new();
        table.install_variable("i", table.integer).unwrap();
        table.install_variable("lim", table.integer).unwrap();

        let lim = table.lookup("lim").unwrap();
        match table.get(lim) {
            Symbol::Var { offset, size, .. } => {
                assert_eq!(*offset, 4);
                assert_eq!(*size, 4);
            }
            _ => unreachable!(),
        }
        assert_eq!(table.frame_size(), 8);
    }
}
