//! Análisis sintáctico y plegado semántico.
//!
//! Las declaraciones y sentencias se parsean por descenso recursivo;
//! las expresiones con un motor shift-reduce de dos pilas guiado por
//! precedencias. El resultado es un AST tipado: cada nodo lleva su
//! tipo ya resuelto (o el tipo nulo centinela) y una referencia a su
//! entrada en la tabla de símbolos cuando aplica.
//!
//! Los bucles `while`, `repeat` y `for` se desazucaran aquí mismo a
//! etiquetas, saltos y condicionales, de modo que el generador de
//! código solo ve `if`/`label`/`goto`. Las constantes se sustituyen
//! por sus valores al resolver identificadores, las coerciones
//! entero↔real se insertan como nodos de cast, y los accesos a
//! arreglos y campos de record se reducen a nodos `AREF` de base más
//! desplazamiento en bytes.

use crate::{
    error::Diagnostics,
    lex::{Keyword, Lexer, Op, Token},
    source::{Located, Location, Position},
    symbols::{Literal, Symbol, SymbolId, SymbolTable},
};
use std::{
    fmt::{self, Display},
    rc::Rc,
};

use thiserror::Error;

/// Error sintáctico o semántico. Se reporta y el parseo continúa.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected {expected}, found {found}")]
    UnexpectedToken { expected: &'static str, found: String },

    #[error("Expected {expected} but reached end of input")]
    UnexpectedEof { expected: &'static str },

    #[error("Found dangling right parenthesis")]
    DanglingParen,

    #[error("Unbalanced left parenthesis in expression")]
    UnbalancedParen,

    #[error("Missing operand in expression")]
    MissingOperand,

    #[error("Incorrect number of operands in expression")]
    ExtraOperands,

    #[error("Cannot define type named '{0}' which is a basic type")]
    BasicRedefinition(String),

    #[error("Cannot redefine type '{0}'")]
    Redefinition(String),

    #[error("'{0}' does not name a type")]
    NotAType(String),

    #[error("Bad type declaration, found no parseable type value")]
    BadTypeDecl,

    #[error("Const value must be an integer, real, string or boolean, found {0}")]
    BadConstValue(String),

    #[error("Cannot declare variable '{0}' which is declared as a type")]
    VarIsType(String),

    #[error("Cannot redefine variable '{0}'")]
    VarRedefinition(String),

    #[error("Cannot index into non-array expression '{0}'")]
    NotAnArray(String),

    #[error("Found empty array subscript")]
    EmptySubscript,

    #[error("Cannot use dot operator '.' with non-record expression '{0}'")]
    NotARecord(String),

    #[error("Field '{0}' not found in record")]
    NoSuchField(String),

    #[error("Cannot dereference non-pointer expression '{0}'")]
    NotAPointer(String),

    #[error("Invalid argument to function '{func}': expected {expected}, got {found}")]
    BadArgument {
        func: String,
        expected: String,
        found: String,
    },

    #[error("Label {0} was not declared in a label section")]
    UndeclaredLabel(i32),

    #[error("Expected either `to` or `downto` in for loop, found {0}")]
    ExpectedToOrDownto(String),

    #[error("Symbol table rejected '{0}': {1}")]
    Install(String, crate::symbols::SymbolError),
}

/// Operador binario ya clasificado del AST.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    IntDiv,
    Mod,
    In,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    fn from_op(op: Op) -> BinOp {
        match op {
            Op::Plus => BinOp::Add,
            Op::Minus => BinOp::Sub,
            Op::Times => BinOp::Mul,
            Op::Divide => BinOp::Div,
            Op::Assign => BinOp::Assign,
            Op::Eq => BinOp::Eq,
            Op::Ne => BinOp::Ne,
            Op::Lt => BinOp::Lt,
            Op::Le => BinOp::Le,
            Op::Gt => BinOp::Gt,
            Op::Ge => BinOp::Ge,
            Op::And => BinOp::And,
            Op::Or => BinOp::Or,
            Op::Div => BinOp::IntDiv,
            Op::Mod => BinOp::Mod,
            Op::In => BinOp::In,
            Op::Not | Op::Caret | Op::Dot => unreachable!("handled before binary reduction"),
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Assign => ":=",
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::IntDiv => "DIV",
            BinOp::Mod => "MOD",
            BinOp::In => "IN",
        };
        fmt.write_str(string)
    }
}

/// Clase de un nodo del AST.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Sentencia vacía o nodo centinela tras un error.
    Empty,

    /// Raíz: nombre del programa y un hijo con el bloque principal.
    Program(String),

    Int(i32),
    Real(f64),
    Str(String),

    /// Referencia a una variable (o nombre suelto de campo).
    Var(String),

    Binary(BinOp),

    /// Negación aritmética unaria.
    Neg,

    /// Negación booleana unaria.
    Not,

    /// Cómputo de dirección base más offset en bytes, con
    /// dereferencia automática en el punto de uso.
    Aref,

    /// Dereferencia de puntero `p^`.
    Deref,

    CastReal,
    CastInt,

    /// Llamada a función integrada, por nombre.
    Funcall(String),

    /// Agrupación ordenada de sentencias.
    Progn,

    If,
    Label(usize),
    Goto(usize),
}

/// Un nodo del AST. Todos los nodos llevan uniformemente su tipo
/// resuelto, su entrada de tabla de símbolos y sus hijos ordenados;
/// ambos handles admiten el centinela nulo.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: SymbolId,
    pub symbol: SymbolId,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Node {
            kind,
            ty: SymbolId::NULL,
            symbol: SymbolId::NULL,
            children: Vec::new(),
        }
    }

    pub fn with(kind: NodeKind, children: Vec<Node>) -> Self {
        Node {
            kind,
            ty: SymbolId::NULL,
            symbol: SymbolId::NULL,
            children,
        }
    }

    /// Forma corta del nodo, sin hijos: para comentarios de traza.
    pub fn head(&self) -> String {
        match &self.kind {
            NodeKind::Empty => "NULL".to_owned(),
            NodeKind::Program(name) => format!("PROGRAM {}", name),
            NodeKind::Int(value) => format!("INTEGER {}", value),
            NodeKind::Real(value) => format!("REAL {}", value),
            NodeKind::Str(value) => format!("STRING '{}'", value),
            NodeKind::Var(name) => format!("ID {}", name),
            NodeKind::Binary(op) => op.to_string(),
            NodeKind::Neg => "-".to_owned(),
            NodeKind::Not => "NOT".to_owned(),
            NodeKind::Aref => "AREF".to_owned(),
            NodeKind::Deref => "^".to_owned(),
            NodeKind::CastReal => "CASTREAL".to_owned(),
            NodeKind::CastInt => "CASTINT".to_owned(),
            NodeKind::Funcall(name) => format!("FUNCALL {}", name),
            NodeKind::Progn => "PROGN".to_owned(),
            NodeKind::If => "IF".to_owned(),
            NodeKind::Label(index) => format!("LABEL {}", index),
            NodeKind::Goto(index) => format!("GOTO {}", index),
        }
    }

    /// Forma s-expression de una sola línea, para comentarios de traza.
    pub fn sexpr(&self) -> String {
        let mut text = format!("({}", self.head());
        for child in &self.children {
            text.push(' ');
            text.push_str(&child.sexpr());
        }
        text.push(')');
        text
    }

    /// Forma s-expression indentada, para el volcado del AST.
    pub fn sexpr_pretty(&self, indent: usize) -> String {
        if self.children.is_empty() {
            return format!("{:indent$}({})", "", self.head(), indent = indent);
        }

        let mut text = format!("{:indent$}({}", "", self.head(), indent = indent);
        for child in &self.children {
            text.push('\n');
            text.push_str(&child.sexpr_pretty(indent + 4));
        }
        text.push(')');
        text
    }
}

/// Lista de etiquetas compartida entre usuario y compilador.
///
/// Las etiquetas declaradas por el usuario ocupan los índices
/// `0..U-1` en orden de declaración; las generadas por el compilador
/// continúan desde `U`. La emisión usa siempre el índice (`L<n>`),
/// nunca el número que escribió el usuario.
#[derive(Clone, Default)]
pub struct Labels {
    user: Vec<i32>,
    next: usize,
}

impl Labels {
    pub fn add_user(&mut self, number: i32) {
        self.user.push(number);
        self.next += 1;
    }

    pub fn lookup_user(&self, number: i32) -> Option<usize> {
        self.user.iter().position(|&n| n == number)
    }

    /// Reserva el siguiente índice de etiqueta generada.
    pub fn fresh(&mut self) -> usize {
        let label = self.next;
        self.next += 1;
        label
    }
}

/// Resultado completo del análisis.
pub struct Parsed {
    pub ast: Node,
    pub symbols: SymbolTable,
    pub labels: Labels,
    pub diagnostics: Diagnostics,
}

/// Entrada pendiente en la pila de operadores.
enum Pending {
    Lparen,
    Funcall {
        name: String,
        symbol: SymbolId,
        ty: SymbolId,
    },
    Op(Op),
}

impl Pending {
    fn precedence(&self) -> u8 {
        match self {
            Pending::Lparen => 0,
            Pending::Funcall { .. } => 7,
            Pending::Op(op) => op.precedence(),
        }
    }

    fn is_delimiter(&self) -> bool {
        matches!(self, Pending::Lparen)
    }
}

/// Resultado de resolver un identificador dentro de una expresión.
enum Resolved {
    Operand(Node),
    Function {
        name: String,
        symbol: SymbolId,
        ty: SymbolId,
    },
}

pub struct Parser {
    lexer: Lexer,
    saved: Option<Located<Token>>,
    symbols: SymbolTable,
    labels: Labels,
    diagnostics: Diagnostics,
    last_location: Location,
}

impl Parser {
    pub fn new(source: &str, name: impl Into<Rc<str>>) -> Self {
        let from: Rc<str> = name.into();
        Parser {
            lexer: Lexer::new(source, Rc::clone(&from)),
            saved: None,
            symbols: SymbolTable::new(),
            labels: Labels::default(),
            diagnostics: Diagnostics::default(),
            last_location: Location::point(from, Position::default()),
        }
    }

    /// Consume todo el programa y entrega el AST junto con la tabla
    /// de símbolos, la lista de etiquetas y los diagnósticos.
    pub fn parse(mut self) -> Parsed {
        let ast = self.parse_program();
        Parsed {
            ast,
            symbols: self.symbols,
            labels: self.labels,
            diagnostics: self.diagnostics,
        }
    }

    fn here(&self) -> Location {
        self.last_location.clone()
    }

    fn report(&mut self, error: ParserError) {
        let location = self.here();
        self.diagnostics.push(Located::at(error, location));
    }

    fn next_token(&mut self) -> Option<Located<Token>> {
        if let Some(token) = self.saved.take() {
            self.last_location = token.location().clone();
            return Some(token);
        }

        loop {
            match self.lexer.next()? {
                Ok(token) => {
                    self.last_location = token.location().clone();
                    return Some(token);
                }
                // Los errores léxicos se acumulan y el escaneo sigue
                Err(error) => self.diagnostics.push(error),
            }
        }
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.saved.is_none() {
            self.saved = loop {
                match self.lexer.next() {
                    Some(Ok(token)) => break Some(token),
                    Some(Err(error)) => self.diagnostics.push(error),
                    None => break None,
                }
            };
        }

        self.saved.as_ref().map(|token| token.val())
    }

    fn peek_is(&mut self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek_is(token) {
            self.next_token();
            true
        } else {
            false
        }
    }

    /// Consume el siguiente token, que debe ser el esperado. Un token
    /// distinto produce un diagnóstico pero queda consumido de todos
    /// modos: el parseo es de una pasada y mejor-esfuerzo.
    fn expect(&mut self, token: &Token, expected: &'static str) {
        match self.next_token() {
            Some(found) if found.val() == token => {}
            Some(found) => self.report(ParserError::UnexpectedToken {
                expected,
                found: found.val().to_string(),
            }),
            None => self.report(ParserError::UnexpectedEof { expected }),
        }
    }

    fn expect_identifier(&mut self) -> String {
        match self.next_token() {
            Some(found) => match found.into_inner() {
                Token::Id(name) => name,
                other => {
                    self.report(ParserError::UnexpectedToken {
                        expected: "an identifier",
                        found: other.to_string(),
                    });
                    String::new()
                }
            },
            None => {
                self.report(ParserError::UnexpectedEof {
                    expected: "an identifier",
                });
                String::new()
            }
        }
    }

    fn expect_integer(&mut self) -> i32 {
        match self.next_token() {
            Some(found) => match found.into_inner() {
                Token::Int(value) => value,
                other => {
                    self.report(ParserError::UnexpectedToken {
                        expected: "an integer",
                        found: other.to_string(),
                    });
                    0
                }
            },
            None => {
                self.report(ParserError::UnexpectedEof {
                    expected: "an integer",
                });
                0
            }
        }
    }

    fn int_node(&self, value: i32) -> Node {
        let mut node = Node::new(NodeKind::Int(value));
        node.ty = self.symbols.integer;
        node
    }

    // ------------------------------------------------------------
    // Programa y secciones de declaración
    // ------------------------------------------------------------

    /// `program ID ( ID ) ; BLOQUE .`
    fn parse_program(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::Program), "`program`");
        let name = self.expect_identifier();
        self.expect(&Token::LParen, "`(`");
        let _stream = self.expect_identifier();
        self.expect(&Token::RParen, "`)`");
        self.expect(&Token::Semicolon, "`;`");
        let block = self.parse_block();
        self.expect(&Token::Op(Op::Dot), "`.`");
        Node::with(NodeKind::Program(name), vec![block])
    }

    /// Las secciones de declaración instalan etiquetas, constantes,
    /// tipos y variables; solo el bloque begin/end produce AST.
    fn parse_block(&mut self) -> Node {
        self.read_label_section();
        self.read_const_section();
        self.read_type_section();
        self.read_var_section();
        self.parse_begin()
    }

    fn read_label_section(&mut self) {
        if self.eat(&Token::Keyword(Keyword::Label)) {
            let number = self.expect_integer();
            self.labels.add_user(number);
            while self.eat(&Token::Comma) {
                let number = self.expect_integer();
                self.labels.add_user(number);
            }
            self.expect(&Token::Semicolon, "`;`");
        }
    }

    fn read_const_section(&mut self) {
        if self.eat(&Token::Keyword(Keyword::Const)) {
            loop {
                self.read_const_definition();
                if !matches!(self.peek(), Some(Token::Id(_))) {
                    break;
                }
            }
        }
    }

    fn read_const_definition(&mut self) {
        let id = self.expect_identifier();
        self.expect(&Token::Op(Op::Eq), "`=`");
        match self.next_token().map(Located::into_inner) {
            Some(Token::Int(value)) => self.install_const(&id, Literal::Int(value)),
            Some(Token::Real(value)) => self.install_const(&id, Literal::Real(value)),
            Some(Token::Str(value)) => self.install_const(&id, Literal::Str(value)),
            Some(Token::Bool(value)) => self.install_const(&id, Literal::Bool(value)),
            Some(other) => self.report(ParserError::BadConstValue(other.to_string())),
            None => self.report(ParserError::UnexpectedEof {
                expected: "a constant value",
            }),
        }
        self.expect(&Token::Semicolon, "`;`");
    }

    /// Las constantes se definen antes de los tipos compuestos, por
    /// lo que su valor siempre es de tipo básico.
    fn install_const(&mut self, name: &str, value: Literal) {
        let ty = self.symbols.basic_of(&value);
        let symbol = Symbol::Const {
            name: name.to_owned(),
            ty,
            value,
        };
        if let Err(error) = self.symbols.insert(name, symbol) {
            self.report(ParserError::Install(name.to_owned(), error));
        }
    }

    fn read_type_section(&mut self) {
        if self.eat(&Token::Keyword(Keyword::Type)) {
            loop {
                self.read_type_definition();
                if !matches!(self.peek(), Some(Token::Id(_))) {
                    break;
                }
            }
        }
    }

    fn read_type_definition(&mut self) {
        let id = self.expect_identifier();
        self.expect(&Token::Op(Op::Eq), "`=`");
        let ty = self.read_type();
        self.expect(&Token::Semicolon, "`;`");
        self.install_type(&id, ty);
    }

    /// Lado derecho de una definición de tipo, o lo que sigue a los
    /// dos puntos en una definición de variable.
    fn read_type(&mut self) -> SymbolId {
        match self.peek() {
            Some(Token::Keyword(Keyword::Array)) => self.read_array_type(),
            Some(Token::Keyword(Keyword::Record)) => self.read_record_type(),
            Some(Token::Op(Op::Caret)) => self.read_pointer_type(),
            _ => self.read_simple_type(),
        }
    }

    /// Instala una definición de tipo sobre su stub. Las declaraciones
    /// adelantadas implican que el nombre puede existir ya como stub
    /// sin destino; fijarlo dos veces es una redefinición.
    fn install_type(&mut self, name: &str, ty: SymbolId) {
        let entry = self.symbols.lookup_or_insert_type(name);
        match self.symbols.get(entry) {
            Symbol::Basic { .. } => {
                self.report(ParserError::BasicRedefinition(name.to_owned()));
            }
            Symbol::Stub { target, .. } => {
                if target.is_null() {
                    self.symbols.set_stub_target(entry, ty);
                } else {
                    self.report(ParserError::Redefinition(name.to_owned()));
                }
            }
            _ => self.report(ParserError::NotAType(name.to_owned())),
        }
    }

    /// `^ TYPEID`
    fn read_pointer_type(&mut self) -> SymbolId {
        self.expect(&Token::Op(Op::Caret), "`^`");
        let target = self.read_type_identifier();
        self.symbols.alloc(Symbol::Pointer { target })
    }

    /// Nombre de tipo en posición de tipo. Si aún no existe se crea
    /// un stub: así se admite `pp = ^person` antes de `person`.
    fn read_type_identifier(&mut self) -> SymbolId {
        let id = self.expect_identifier();
        let symbol = self.symbols.lookup_or_insert_type(&id);
        match self.symbols.get(symbol) {
            Symbol::Basic { .. }
            | Symbol::Stub { .. }
            | Symbol::Pointer { .. }
            | Symbol::Subrange { .. }
            | Symbol::Record { .. }
            | Symbol::Array { .. } => symbol,
            _ => {
                self.report(ParserError::NotAType(id));
                SymbolId::NULL
            }
        }
    }

    /// `array [ SIMPLE, SIMPLE, ... ] of TYPE`
    fn read_array_type(&mut self) -> SymbolId {
        self.expect(&Token::Keyword(Keyword::Array), "`array`");
        self.expect(&Token::LBracket, "`[`");
        let mut ranges = vec![self.read_simple_type()];
        while self.eat(&Token::Comma) {
            ranges.push(self.read_simple_type());
        }
        self.expect(&Token::RBracket, "`]`");
        self.expect(&Token::Keyword(Keyword::Of), "`of`");
        let elem = self.read_type();
        match self.symbols.make_array(&ranges, elem) {
            Ok(array) => array,
            Err(error) => {
                self.report(ParserError::Install("array".to_owned(), error));
                SymbolId::NULL
            }
        }
    }

    /// Otro identificador de tipo, una enumeración o un subrango.
    fn read_simple_type(&mut self) -> SymbolId {
        match self.peek() {
            Some(Token::Id(_)) => self.read_type_identifier(),
            Some(Token::LParen) => self.read_enum(),
            Some(Token::Int(_)) => self.read_subrange(),
            _ => {
                self.report(ParserError::BadTypeDecl);
                SymbolId::NULL
            }
        }
    }

    /// `INTEGER .. INTEGER`
    fn read_subrange(&mut self) -> SymbolId {
        let low = self.expect_integer();
        self.expect(&Token::DotDot, "`..`");
        let high = self.expect_integer();
        self.symbols.alloc(Symbol::Subrange { low, high })
    }

    /// `( ID, ID, ..., ID )`. Cada identificador queda instalado como
    /// constante entera secuencial y el tipo es el subrango `0..N-1`.
    fn read_enum(&mut self) -> SymbolId {
        self.expect(&Token::LParen, "`(`");
        let mut count = 0;
        let id = self.expect_identifier();
        self.install_const(&id, Literal::Int(count));
        count += 1;
        while self.eat(&Token::Comma) {
            let id = self.expect_identifier();
            self.install_const(&id, Literal::Int(count));
            count += 1;
        }
        self.expect(&Token::RParen, "`)`");
        self.symbols.alloc(Symbol::Subrange {
            low: 0,
            high: count - 1,
        })
    }

    /// `record LISTA-DE-CAMPOS end`
    fn read_record_type(&mut self) -> SymbolId {
        self.expect(&Token::Keyword(Keyword::Record), "`record`");
        let fields = self.read_field_list();
        self.expect(&Token::Keyword(Keyword::End), "`end`");
        let fields = self.symbols.finalize_fields(fields);
        self.symbols.alloc(Symbol::Record { fields })
    }

    fn read_field_list(&mut self) -> Vec<(String, SymbolId)> {
        let mut fields = Vec::new();
        if matches!(self.peek(), Some(Token::Id(_))) {
            self.read_record_field(&mut fields);
            while self.eat(&Token::Semicolon) {
                let before = fields.len();
                self.read_record_field(&mut fields);
                if fields.len() == before {
                    let found = self
                        .peek()
                        .map(Token::to_string)
                        .unwrap_or_else(|| "end of input".to_owned());
                    self.report(ParserError::UnexpectedToken {
                        expected: "more fields after `;` in record",
                        found,
                    });
                }
            }
        }
        fields
    }

    /// `IDLIST : TYPE` dentro de un record.
    fn read_record_field(&mut self, fields: &mut Vec<(String, SymbolId)>) {
        if !matches!(self.peek(), Some(Token::Id(_))) {
            return;
        }
        let ids = self.read_id_list();
        self.expect(&Token::Colon, "`:`");
        let ty = self.read_type();
        for id in ids {
            fields.push((id, ty));
        }
    }

    fn read_id_list(&mut self) -> Vec<String> {
        let mut ids = vec![self.expect_identifier()];
        while self.eat(&Token::Comma) {
            ids.push(self.expect_identifier());
        }
        ids
    }

    fn read_var_section(&mut self) {
        if self.eat(&Token::Keyword(Keyword::Var)) {
            loop {
                self.read_var_definition();
                self.expect(&Token::Semicolon, "`;`");
                if !matches!(self.peek(), Some(Token::Id(_))) {
                    break;
                }
            }
        }
    }

    fn read_var_definition(&mut self) {
        let ids = self.read_id_list();
        self.expect(&Token::Colon, "`:`");
        let ty = self.read_type();
        for id in ids {
            self.install_variable(&id, ty);
        }
    }

    fn install_variable(&mut self, name: &str, ty: SymbolId) {
        match self.symbols.lookup(name) {
            None => {
                if let Err(error) = self.symbols.install_variable(name, ty) {
                    self.report(ParserError::Install(name.to_owned(), error));
                }
            }
            Some(existing) => match self.symbols.get(existing) {
                Symbol::Var { .. } => self.report(ParserError::VarRedefinition(name.to_owned())),
                _ => self.report(ParserError::VarIsType(name.to_owned())),
            },
        }
    }

    // ------------------------------------------------------------
    // Sentencias
    // ------------------------------------------------------------

    /// `begin SENTENCIA ; SENTENCIA ; ... end`
    fn parse_begin(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::Begin), "`begin`");
        let mut statements = vec![self.parse_statement()];
        while self.eat(&Token::Semicolon) {
            statements.push(self.parse_statement());
        }
        self.expect(&Token::Keyword(Keyword::End), "`end`");
        Node::with(NodeKind::Progn, statements)
    }

    fn parse_statement(&mut self) -> Node {
        // Un entero seguido de `:` etiqueta la sentencia que sigue
        if matches!(self.peek(), Some(Token::Int(_))) {
            let number = self.expect_integer();
            let index = self.user_label_index(number);
            self.expect(&Token::Colon, "`:`");
            return Node::with(
                NodeKind::Progn,
                vec![Node::new(NodeKind::Label(index)), self.parse_statement()],
            );
        }

        match self.peek() {
            Some(Token::Id(_)) => self.parse_expr(),
            Some(Token::Keyword(Keyword::Begin)) => self.parse_begin(),
            Some(Token::Keyword(Keyword::If)) => self.parse_if(),
            Some(Token::Keyword(Keyword::While)) => self.parse_while(),
            Some(Token::Keyword(Keyword::Repeat)) => self.parse_repeat(),
            Some(Token::Keyword(Keyword::For)) => self.parse_for(),
            Some(Token::Keyword(Keyword::Goto)) => self.parse_goto(),
            _ => Node::new(NodeKind::Empty),
        }
    }

    fn user_label_index(&mut self, number: i32) -> usize {
        match self.labels.lookup_user(number) {
            Some(index) => index,
            None => {
                self.report(ParserError::UndeclaredLabel(number));
                self.labels.fresh()
            }
        }
    }

    /// `goto NUM`
    fn parse_goto(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::Goto), "`goto`");
        let number = self.expect_integer();
        let index = self.user_label_index(number);
        Node::new(NodeKind::Goto(index))
    }

    /// `if EXPR then SENTENCIA [else SENTENCIA]`
    fn parse_if(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::If), "`if`");
        let condition = self.parse_expr();
        self.expect(&Token::Keyword(Keyword::Then), "`then`");
        let then_branch = self.parse_statement();
        if self.eat(&Token::Keyword(Keyword::Else)) {
            let else_branch = self.parse_statement();
            make_if(condition, then_branch, Some(else_branch))
        } else {
            make_if(condition, then_branch, None)
        }
    }

    /// `while C do B` se reescribe a `{ Lk: if C then { B; goto Lk } }`.
    fn parse_while(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::While), "`while`");
        let condition = self.parse_expr();
        self.expect(&Token::Keyword(Keyword::Do), "`do`");
        let body = self.parse_statement();

        let label = self.labels.fresh();
        let then_branch = Node::with(
            NodeKind::Progn,
            vec![body, Node::new(NodeKind::Goto(label))],
        );
        Node::with(
            NodeKind::Progn,
            vec![
                Node::new(NodeKind::Label(label)),
                make_if(condition, then_branch, None),
            ],
        )
    }

    /// `repeat B until C` se reescribe a
    /// `{ Lk: B; if C then { } else goto Lk }`.
    fn parse_repeat(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::Repeat), "`repeat`");
        let mut statements = vec![self.parse_statement()];
        while self.eat(&Token::Semicolon) {
            statements.push(self.parse_statement());
        }
        let body = Node::with(NodeKind::Progn, statements);
        self.expect(&Token::Keyword(Keyword::Until), "`until`");
        let condition = self.parse_expr();

        let label = self.labels.fresh();
        let exit = make_if(
            condition,
            Node::new(NodeKind::Progn),
            Some(Node::new(NodeKind::Goto(label))),
        );
        Node::with(
            NodeKind::Progn,
            vec![Node::new(NodeKind::Label(label)), body, exit],
        )
    }

    /// `for v := S (to|downto) E do B` se reescribe a
    /// `{ v := S; Lk: if v <= E then { B; v := v+1; goto Lk } }`,
    /// con `>=` y `-1` para `downto`.
    fn parse_for(&mut self) -> Node {
        self.expect(&Token::Keyword(Keyword::For), "`for`");
        let name = self.expect_identifier();
        let var = match self.resolve_identifier(name) {
            Resolved::Operand(node) => node,
            Resolved::Function { name, .. } => {
                self.report(ParserError::UnexpectedToken {
                    expected: "a variable of iteration",
                    found: format!("function `{}`", name),
                });
                Node::new(NodeKind::Empty)
            }
        };
        self.expect(&Token::Op(Op::Assign), "`:=`");
        let init = self.parse_expr();

        let down = if self.eat(&Token::Keyword(Keyword::Downto)) {
            true
        } else if self.eat(&Token::Keyword(Keyword::To)) {
            false
        } else {
            let found = self
                .peek()
                .map(Token::to_string)
                .unwrap_or_else(|| "end of input".to_owned());
            self.report(ParserError::ExpectedToOrDownto(found));
            false
        };

        let end = self.parse_expr();
        self.expect(&Token::Keyword(Keyword::Do), "`do`");
        let body = self.parse_statement();

        let init_assign = self.make_binary(BinOp::Assign, var.clone(), init);
        let label = self.labels.fresh();
        let (cmp, step) = if down {
            (BinOp::Ge, BinOp::Sub)
        } else {
            (BinOp::Le, BinOp::Add)
        };
        let condition = self.make_binary(cmp, var.clone(), end);
        let update_value = self.make_binary(step, var.clone(), self.int_node(1));
        let update = self.make_binary(BinOp::Assign, var, update_value);
        let then_branch = Node::with(
            NodeKind::Progn,
            vec![body, update, Node::new(NodeKind::Goto(label))],
        );

        Node::with(
            NodeKind::Progn,
            vec![
                init_assign,
                Node::new(NodeKind::Label(label)),
                make_if(condition, then_branch, None),
            ],
        )
    }

    // ------------------------------------------------------------
    // Expresiones: shift-reduce con precedencias
    // ------------------------------------------------------------

    /// Parsea una expresión, lo cual incluye asignaciones, accesos a
    /// campos, referencias a arreglos y llamadas a funciones.
    fn parse_expr(&mut self) -> Node {
        let mut operators: Vec<Pending> = Vec::new();
        let mut operands: Vec<Node> = Vec::new();

        loop {
            match self.peek() {
                Some(Token::Int(_) | Token::Real(_) | Token::Str(_) | Token::Bool(_)) => {
                    let literal = self.next_token().unwrap().into_inner();
                    operands.push(self.literal_node(literal));
                }

                // nil es un alias de un puntero a cero
                Some(Token::Keyword(Keyword::Nil)) => {
                    self.next_token();
                    let mut node = Node::new(NodeKind::Int(0));
                    node.ty = self.symbols.generic_pointer;
                    operands.push(node);
                }

                Some(Token::Id(_)) => {
                    let name = self.expect_identifier();
                    match self.resolve_identifier(name) {
                        Resolved::Operand(node) => operands.push(node),
                        Resolved::Function { name, symbol, ty } => {
                            operators.push(Pending::Funcall { name, symbol, ty });
                        }
                    }
                }

                Some(Token::LParen) => {
                    self.next_token();
                    operators.push(Pending::Lparen);
                }

                Some(Token::RParen) => {
                    self.next_token();
                    while operators.last().is_some_and(|top| !top.is_delimiter()) {
                        self.reduce(&mut operators, &mut operands);
                    }
                    if operators.pop().is_none() {
                        self.report(ParserError::DanglingParen);
                    }
                }

                Some(Token::LBracket) => {
                    let indices = self.parse_array_index();
                    let base = self.pop_operand(&mut operands);
                    let node = self.reduce_aref_list(base, indices);
                    operands.push(node);
                }

                Some(Token::Op(op)) => {
                    let op = *op;
                    self.next_token();
                    while operators
                        .last()
                        .is_some_and(|top| !top.is_delimiter() && top.precedence() >= op.precedence())
                    {
                        self.reduce(&mut operators, &mut operands);
                    }
                    operators.push(Pending::Op(op));
                }

                // Cualquier otro token termina la expresión sin consumirse
                _ => break,
            }
        }

        while !operators.is_empty() {
            self.reduce(&mut operators, &mut operands);
        }

        if operands.len() > 1 {
            self.report(ParserError::ExtraOperands);
        }
        self.pop_operand(&mut operands)
    }

    fn literal_node(&self, token: Token) -> Node {
        let (kind, ty) = match token {
            Token::Int(value) => (NodeKind::Int(value), self.symbols.integer),
            Token::Real(value) => (NodeKind::Real(value), self.symbols.real),
            Token::Str(value) => (NodeKind::Str(value), self.symbols.chr),
            Token::Bool(value) => (NodeKind::Int(value as i32), self.symbols.boolean),
            _ => unreachable!("not a literal token"),
        };

        let mut node = Node::new(kind);
        node.ty = ty;
        node
    }

    /// Resuelve un identificador: las funciones van a la pila de
    /// operadores, las constantes se pliegan a literales, y las
    /// variables cargan su tipo resuelto y su entrada de tabla.
    /// Un nombre desconocido produce un nodo sin tipo: puede ser el
    /// nombre de un campo de record, que se valida al reducir `.`.
    fn resolve_identifier(&mut self, name: String) -> Resolved {
        let Some(symbol) = self.symbols.lookup(&name) else {
            return Resolved::Operand(Node::new(NodeKind::Var(name)));
        };

        match self.symbols.get(symbol) {
            Symbol::Function { result, .. } => {
                let ty = self.symbols.resolve(*result);
                Resolved::Function { name, symbol, ty }
            }

            Symbol::Var { ty, .. } => {
                let mut node = Node::new(NodeKind::Var(name));
                node.ty = self.symbols.resolve(*ty);
                node.symbol = symbol;
                Resolved::Operand(node)
            }

            // Plegado de constantes: la referencia se vuelve literal
            Symbol::Const { ty, value, .. } => {
                let kind = match value {
                    Literal::Int(v) => NodeKind::Int(*v),
                    Literal::Real(v) => NodeKind::Real(*v),
                    Literal::Str(v) => NodeKind::Str(v.clone()),
                    Literal::Bool(v) => NodeKind::Int(*v as i32),
                };
                let mut node = Node::new(kind);
                node.ty = *ty;
                node.symbol = symbol;
                Resolved::Operand(node)
            }

            // Un nombre de tipo en posición de expresión
            _ => {
                let mut node = Node::new(NodeKind::Var(name));
                node.ty = self.symbols.resolve(symbol);
                Resolved::Operand(node)
            }
        }
    }

    fn pop_operand(&mut self, operands: &mut Vec<Node>) -> Node {
        match operands.pop() {
            Some(node) => node,
            None => {
                self.report(ParserError::MissingOperand);
                Node::new(NodeKind::Empty)
            }
        }
    }

    /// Saca un operador pendiente y construye el nodo que corresponde,
    /// empujándolo de vuelta como operando.
    fn reduce(&mut self, operators: &mut Vec<Pending>, operands: &mut Vec<Node>) {
        let Some(op) = operators.pop() else { return };

        let node = match op {
            Pending::Lparen => {
                self.report(ParserError::UnbalancedParen);
                return;
            }

            Pending::Funcall { name, symbol, ty } => match name.as_str() {
                "new" => self.reduce_new(symbol, operands),
                "write" | "writeln" => self.reduce_write(name, operands),
                _ => self.reduce_funcall(name, symbol, ty, operands),
            },

            Pending::Op(Op::Caret) => {
                let arg = self.pop_operand(operands);
                self.reduce_deref(arg)
            }

            // Un menos es negación cuando lo que queda en el tope de
            // la pila es un delimitador o un operador distinto de `:=`
            Pending::Op(Op::Minus)
                if matches!(operators.last(), Some(Pending::Lparen))
                    || matches!(operators.last(), Some(Pending::Op(top)) if *top != Op::Assign) =>
            {
                let arg = self.pop_operand(operands);
                let mut node = Node::new(NodeKind::Neg);
                node.ty = arg.ty;
                node.children.push(arg);
                node
            }

            Pending::Op(Op::Not) => {
                let arg = self.pop_operand(operands);
                let mut node = Node::new(NodeKind::Not);
                node.ty = arg.ty;
                node.children.push(arg);
                node
            }

            Pending::Op(Op::Dot) => {
                let rhs = self.pop_operand(operands);
                let lhs = self.pop_operand(operands);
                self.reduce_dot(lhs, rhs)
            }

            Pending::Op(op) => {
                let rhs = self.pop_operand(operands);
                let lhs = self.pop_operand(operands);
                self.make_binary(BinOp::from_op(op), lhs, rhs)
            }
        };

        operands.push(node);
    }

    fn cast_real(&self, expr: Node) -> Node {
        let mut node = Node::with(NodeKind::CastReal, vec![expr]);
        node.ty = self.symbols.real;
        node
    }

    fn cast_int(&self, expr: Node) -> Node {
        let mut node = Node::with(NodeKind::CastInt, vec![expr]);
        node.ty = self.symbols.integer;
        node
    }

    /// Construye un nodo binario, insertando coerciones entero↔real.
    /// En una asignación se coerciona el lado derecho al tipo del
    /// izquierdo; en aritmética el lado entero sube a real y el
    /// resultado es real. Las comparaciones producen boolean.
    fn make_binary(&mut self, op: BinOp, lhs: Node, rhs: Node) -> Node {
        let integer = self.symbols.integer;
        let real = self.symbols.real;
        let mut node = Node::new(NodeKind::Binary(op));

        if op == BinOp::Assign {
            if lhs.ty == integer && rhs.ty == real {
                // Coerción con pérdida; la advertencia está suprimida
                let cast = self.cast_int(rhs);
                node.children = vec![lhs, cast];
            } else if lhs.ty == real && rhs.ty == integer {
                let cast = self.cast_real(rhs);
                node.children = vec![lhs, cast];
            } else {
                node.children = vec![lhs, rhs];
            }
        } else {
            if lhs.ty == integer && rhs.ty == real {
                node.ty = rhs.ty;
                let cast = self.cast_real(lhs);
                node.children = vec![cast, rhs];
            } else if lhs.ty == real && rhs.ty == integer {
                node.ty = lhs.ty;
                let cast = self.cast_real(rhs);
                node.children = vec![lhs, cast];
            } else {
                node.ty = self.symbols.resolve(lhs.ty);
                node.children = vec![lhs, rhs];
            }

            if op.is_comparison() {
                node.ty = self.symbols.boolean;
            }
        }

        node
    }

    /// `new(p)` asigna una dirección: `(:= p (funcall new sizeof(*p)))`.
    fn reduce_new(&mut self, symbol: SymbolId, operands: &mut Vec<Node>) -> Node {
        let arg = self.pop_operand(operands);
        let pointee = match self.symbols.get(self.symbols.resolve(arg.ty)) {
            Symbol::Pointer { target } => *target,
            _ => {
                self.report(ParserError::NotAPointer(arg.sexpr()));
                return Node::new(NodeKind::Empty);
            }
        };

        let size = self.symbols.size_of(pointee);
        let mut call = Node::with(
            NodeKind::Funcall("new".to_owned()),
            vec![self.int_node(size as i32)],
        );
        call.ty = self.symbols.generic_pointer;
        call.symbol = symbol;

        Node::with(NodeKind::Binary(BinOp::Assign), vec![arg, call])
    }

    /// `write`/`writeln` se especializan por el tipo del argumento:
    /// `writei`/`writelni` para enteros, `writef`/`writelnf` para
    /// reales. Las cadenas usan la forma original.
    fn reduce_write(&mut self, mut name: String, operands: &mut Vec<Node>) -> Node {
        let arg = self.pop_operand(operands);
        if arg.ty == self.symbols.integer {
            name.push('i');
        } else if arg.ty == self.symbols.real {
            name.push('f');
        }

        let symbol = self.symbols.lookup(&name).unwrap_or(SymbolId::NULL);
        let mut node = Node::with(NodeKind::Funcall(name), vec![arg]);
        node.symbol = symbol;
        node
    }

    fn reduce_funcall(
        &mut self,
        name: String,
        symbol: SymbolId,
        ty: SymbolId,
        operands: &mut Vec<Node>,
    ) -> Node {
        let declared = match self.symbols.get(symbol) {
            Symbol::Function { args, .. } => args[0],
            _ => SymbolId::NULL,
        };

        // Las integradas sin argumento declarado (read, readln, eof)
        // admiten que no haya operando
        let arg = if operands.is_empty() && declared.is_null() {
            None
        } else {
            Some(self.pop_operand(operands))
        };

        let mut node = Node::new(NodeKind::Funcall(name.clone()));
        node.ty = ty;
        node.symbol = symbol;

        if let Some(arg) = arg {
            if declared.is_null() || arg.ty == self.symbols.resolve(declared) {
                node.children.push(arg);
            } else if arg.ty == self.symbols.integer && declared == self.symbols.real {
                let cast = self.cast_real(arg);
                node.children.push(cast);
            } else {
                self.report(ParserError::BadArgument {
                    func: name,
                    expected: format!("{:?}", self.symbols.get(self.symbols.resolve(declared))),
                    found: arg.sexpr(),
                });
            }
        }

        node
    }

    /// `[ EXPR, EXPR ] [ EXPR ] ...`: todos los índices de grupos de
    /// corchetes adyacentes, en orden de aparición.
    fn parse_array_index(&mut self) -> Vec<Node> {
        self.expect(&Token::LBracket, "`[`");
        let mut indices = vec![self.parse_expr()];
        while self.eat(&Token::Comma) {
            indices.push(self.parse_expr());
        }
        self.expect(&Token::RBracket, "`]`");
        if self.peek_is(&Token::LBracket) {
            indices.extend(self.parse_array_index());
        }
        indices
    }

    fn reduce_aref_list(&mut self, base: Node, indices: Vec<Node>) -> Node {
        if indices.is_empty() {
            self.report(ParserError::EmptySubscript);
            return Node::new(NodeKind::Empty);
        }

        let mut node = base;
        for index in indices {
            node = self.reduce_aref(node, index);
        }
        node
    }

    /// `base[i]` se reduce a `AREF(base, (i - low) * size)`: el
    /// intervalo de índices forma parte del tipo del arreglo, por lo
    /// que el desplazamiento descuenta la cota inferior.
    fn reduce_aref(&mut self, base: Node, index: Node) -> Node {
        let (subrange, elem) = match self.symbols.get(self.symbols.resolve(base.ty)) {
            Symbol::Array { index, elem } => (*index, *elem),
            _ => {
                self.report(ParserError::NotAnArray(base.sexpr()));
                return Node::new(NodeKind::Empty);
            }
        };

        let low = self.symbols.subrange_low(subrange);
        let size = self.symbols.size_of(elem);
        let low_node = self.int_node(low);
        let size_node = self.int_node(size as i32);
        let delta = self.make_binary(BinOp::Sub, index, low_node);
        let offset = self.make_binary(BinOp::Mul, delta, size_node);

        let mut node = Node::with(NodeKind::Aref, vec![base, offset]);
        node.ty = self.symbols.resolve(elem);
        node
    }

    /// `lhs.f` es un acceso a campo: un offset constante desde la
    /// dirección base del record.
    fn reduce_dot(&mut self, lhs: Node, rhs: Node) -> Node {
        if !matches!(self.symbols.get(self.symbols.resolve(lhs.ty)), Symbol::Record { .. }) {
            self.report(ParserError::NotARecord(lhs.sexpr()));
            return Node::new(NodeKind::Empty);
        }

        let NodeKind::Var(field_name) = &rhs.kind else {
            self.report(ParserError::NoSuchField(rhs.sexpr()));
            return Node::new(NodeKind::Empty);
        };

        let Some(field) = self.symbols.record_field(lhs.ty, field_name) else {
            self.report(ParserError::NoSuchField(field_name.clone()));
            return Node::new(NodeKind::Empty);
        };

        let (ty, offset) = match self.symbols.get(field) {
            Symbol::Field { ty, offset, .. } => (*ty, *offset),
            _ => unreachable!("record_field returned a non-field"),
        };

        let offset_node = self.int_node(offset as i32);
        let mut node = Node::with(NodeKind::Aref, vec![lhs, offset_node]);
        node.ty = self.symbols.resolve(ty);
        node
    }

    fn reduce_deref(&mut self, arg: Node) -> Node {
        let target = match self.symbols.get(self.symbols.resolve(arg.ty)) {
            Symbol::Pointer { target } => *target,
            _ => {
                self.report(ParserError::NotAPointer(arg.sexpr()));
                return Node::new(NodeKind::Empty);
            }
        };

        let mut node = Node::with(NodeKind::Deref, vec![arg]);
        node.ty = self.symbols.resolve(target);
        node
    }
}

fn make_if(condition: Node, then_branch: Node, else_branch: Option<Node>) -> Node {
    let mut children = vec![condition, then_branch];
    children.extend(else_branch);
    Node::with(NodeKind::If, children)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Parsed {
        Parser::new(source, "<test>").parse()
    }

    /// El primer statement del bloque principal, como s-expression.
    fn first_statement(source: &str) -> String {
        let parsed = parse(source);
        assert!(
            parsed.diagnostics.is_empty(),
            "unexpected diagnostics:\n{}",
            parsed.diagnostics
        );
        parsed.ast.children[0].children[0].sexpr()
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let stmt = first_statement(
            "program p(output); var a,b,c,d:integer; begin a := b + c * d end.",
        );
        assert_eq!(stmt, "(:= (ID a) (+ (ID b) (* (ID c) (ID d))))");
    }

    #[test]
    fn assignment_binds_loosest() {
        let stmt = first_statement(
            "program p(output); var a:boolean; b,c:integer; begin a := b = c end.",
        );
        assert_eq!(stmt, "(:= (ID a) (= (ID b) (ID c)))");
    }

    #[test]
    fn parentheses_group() {
        let stmt = first_statement(
            "program p(output); var a,b,c,d:integer; begin a := (b + c) * d end.",
        );
        assert_eq!(stmt, "(:= (ID a) (* (+ (ID b) (ID c)) (ID d)))");
    }

    #[test]
    fn unary_minus_after_paren() {
        let stmt = first_statement(
            "program p(output); var a,b:integer; begin a := (-b) end.",
        );
        assert_eq!(stmt, "(:= (ID a) (- (ID b)))");
    }

    #[test]
    fn constants_fold_to_literals() {
        let stmt = first_statement(
            "program p(output); const k = 7; var a:integer; begin a := k end.",
        );
        assert_eq!(stmt, "(:= (ID a) (INTEGER 7))");
    }

    #[test]
    fn integer_to_real_coercion_on_assignment() {
        let stmt = first_statement(
            "program p(output); var x:real; begin x := 1 end.",
        );
        assert_eq!(stmt, "(:= (ID x) (CASTREAL (INTEGER 1)))");
    }

    #[test]
    fn mixed_arithmetic_promotes_integer_side() {
        let stmt = first_statement(
            "program p(output); var x:real; i:integer; begin x := x + i end.",
        );
        assert_eq!(stmt, "(:= (ID x) (+ (ID x) (CASTREAL (ID i))))");
    }

    #[test]
    fn for_loop_desugars_to_label_if_goto() {
        let stmt = first_statement(
            "program p(output); var i,lim:integer; begin for i := 0 to lim do i := i end.",
        );
        assert_eq!(
            stmt,
            "(PROGN (:= (ID i) (INTEGER 0)) \
             (LABEL 0) \
             (IF (<= (ID i) (ID lim)) \
             (PROGN (:= (ID i) (ID i)) \
             (:= (ID i) (+ (ID i) (INTEGER 1))) \
             (GOTO 0))))"
            ,
        );
    }

    #[test]
    fn downto_swaps_comparison_and_step() {
        let stmt = first_statement(
            "program p(output); var i:integer; begin for i := 5 downto 1 do i := i end.",
        );
        assert!(stmt.contains("(>= (ID i) (INTEGER 1))"));
        assert!(stmt.contains("(- (ID i) (INTEGER 1))"));
    }

    #[test]
    fn while_desugars_per_rewrite_rule() {
        let stmt = first_statement(
            "program p(output); var i:integer; begin while i < 3 do i := i + 1 end.",
        );
        assert_eq!(
            stmt,
            "(PROGN (LABEL 0) (IF (< (ID i) (INTEGER 3)) \
             (PROGN (:= (ID i) (+ (ID i) (INTEGER 1))) (GOTO 0))))"
            ,
        );
    }

    #[test]
    fn repeat_desugars_with_inverted_exit() {
        let stmt = first_statement(
            "program p(output); var i:integer; begin repeat i := i + 1 until i = 3 end.",
        );
        assert_eq!(
            stmt,
            "(PROGN (LABEL 0) (PROGN (:= (ID i) (+ (ID i) (INTEGER 1)))) \
             (IF (= (ID i) (INTEGER 3)) (PROGN) (GOTO 0)))"
            ,
        );
    }

    #[test]
    fn nested_subscripts_lower_to_nested_arefs() {
        let stmt = first_statement(
            "program p(output); \
             type m = array[2..5] of array[3..7] of integer; \
             var a:m; i,j,v:integer; \
             begin v := a[i][j] end.",
        );
        // interno: 5 elementos de 4 bytes = 20 por fila
        assert_eq!(
            stmt,
            "(:= (ID v) (AREF (AREF (ID a) (* (- (ID i) (INTEGER 2)) (INTEGER 20))) \
             (* (- (ID j) (INTEGER 3)) (INTEGER 4))))"
            ,
        );
    }

    #[test]
    fn comma_subscripts_equal_adjacent_brackets() {
        let a = first_statement(
            "program p(output); type m = array[1..3, 1..4] of integer; \
             var a:m; i,j,v:integer; begin v := a[i, j] end.",
        );
        let b = first_statement(
            "program p(output); type m = array[1..3, 1..4] of integer; \
             var a:m; i,j,v:integer; begin v := a[i][j] end.",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn new_reduces_to_assignment_of_allocation() {
        let stmt = first_statement(
            "program p(output); type pp = ^person; person = record age: integer end; \
             var q:pp; begin new(q) end.",
        );
        assert_eq!(stmt, "(:= (ID q) (FUNCALL new (INTEGER 4)))");
    }

    #[test]
    fn pointer_field_access_lowers_to_arefs() {
        let stmt = first_statement(
            "program p(output); type pp = ^person; person = record age: integer end; \
             var q:pp; begin q^.age := 41 end.",
        );
        assert_eq!(stmt, "(:= (AREF (^ (ID q)) (INTEGER 0)) (INTEGER 41))");
    }

    #[test]
    fn record_field_offsets_reach_the_ast() {
        let stmt = first_statement(
            "program p(output); type r = record a, b: integer end; \
             var v:r; begin v.b := 1 end.",
        );
        assert_eq!(stmt, "(:= (AREF (ID v) (INTEGER 4)) (INTEGER 1))");
    }

    #[test]
    fn write_specializes_by_argument_type() {
        let ints = first_statement(
            "program p(output); var i:integer; begin writeln(i) end.",
        );
        assert_eq!(ints, "(FUNCALL writelni (ID i))");

        let reals = first_statement(
            "program p(output); var x:real; begin write(x) end.",
        );
        assert_eq!(reals, "(FUNCALL writef (ID x))");

        let strings = first_statement(
            "program p(output); begin writeln('*') end.",
        );
        assert_eq!(strings, "(FUNCALL writeln (STRING '*'))");
    }

    #[test]
    fn integer_argument_to_real_function_is_cast() {
        let stmt = first_statement(
            "program p(output); var x:real; begin x := sqrt(4) end.",
        );
        assert_eq!(stmt, "(:= (ID x) (FUNCALL sqrt (CASTREAL (INTEGER 4))))");
    }

    #[test]
    fn nil_is_a_zero_pointer() {
        let parsed = parse(
            "program p(output); type pp = ^person; person = record age: integer end; \
             var q:pp; begin q := nil end.",
        );
        assert!(parsed.diagnostics.is_empty());
        let stmt = parsed.ast.children[0].children[0].sexpr();
        assert_eq!(stmt, "(:= (ID q) (INTEGER 0))");
    }

    #[test]
    fn forward_declaration_resolves_without_diagnostics() {
        let parsed = parse(
            "program p(output); type pp = ^node; node = record next: pp end; \
             var n:node; begin n.next := nil end.",
        );
        assert!(
            parsed.diagnostics.is_empty(),
            "unexpected diagnostics:\n{}",
            parsed.diagnostics
        );

        let node = parsed.symbols.lookup("node").unwrap();
        let resolved = parsed.symbols.resolve(node);
        assert!(matches!(parsed.symbols.get(resolved), Symbol::Record { .. }));

        let pp = parsed.symbols.lookup("pp").unwrap();
        let pp = parsed.symbols.resolve(pp);
        match parsed.symbols.get(pp) {
            Symbol::Pointer { target } => {
                assert_eq!(parsed.symbols.resolve(*target), resolved);
            }
            other => panic!("pp resolved to {:?}", other),
        }
    }

    #[test]
    fn basic_types_cannot_be_redefined() {
        let parsed = parse(
            "program p(output); type integer = real; var i:integer; begin i := 1 end.",
        );
        assert!(!parsed.diagnostics.is_empty());
        let integer = parsed.symbols.lookup("integer").unwrap();
        assert!(matches!(
            parsed.symbols.get(integer),
            Symbol::Basic { name: "integer", .. }
        ));
    }

    #[test]
    fn enums_install_sequential_constants() {
        let stmt = first_statement(
            "program p(output); type color = (red, green, blue); \
             var c:color; begin c := green end.",
        );
        assert_eq!(stmt, "(:= (ID c) (INTEGER 1))");
    }

    #[test]
    fn user_labels_map_to_declaration_indices() {
        let parsed = parse(
            "program p(output); label 10, 20; var i:integer; \
             begin goto 20; 10: i := 1; 20: goto 10 end.",
        );
        assert!(parsed.diagnostics.is_empty());
        let block = &parsed.ast.children[0];
        assert_eq!(block.children[0].sexpr(), "(GOTO 1)");
        assert_eq!(
            block.children[1].sexpr(),
            "(PROGN (LABEL 0) (:= (ID i) (INTEGER 1)))"
        );
        assert_eq!(block.children[2].sexpr(), "(PROGN (LABEL 1) (GOTO 0))");
    }

    #[test]
    fn generated_labels_continue_after_user_labels() {
        let parsed = parse(
            "program p(output); label 7; var i:integer; \
             begin 7: while i < 3 do i := i + 1 end.",
        );
        assert!(parsed.diagnostics.is_empty());
        // la etiqueta del while es la 1: la 0 pertenece al usuario
        let labeled = &parsed.ast.children[0].children[0];
        assert!(labeled.sexpr().contains("(LABEL 1)"));
    }

    #[test]
    fn labeled_statements_require_declaration() {
        let parsed = parse(
            "program p(output); var i:integer; begin goto 99 end.",
        );
        assert!(!parsed.diagnostics.is_empty());
    }

    #[test]
    fn trailing_semicolon_yields_empty_statement() {
        let parsed = parse("program p(output); var i:integer; begin i := 1; end.");
        assert!(parsed.diagnostics.is_empty());
        let block = &parsed.ast.children[0];
        assert_eq!(block.children.len(), 2);
        assert!(matches!(block.children[1].kind, NodeKind::Empty));
    }

    #[test]
    fn else_branch_is_parsed() {
        let stmt = first_statement(
            "program p(output); var i:integer; \
             begin if i < 0 then i := 1 else i := 2 end.",
        );
        assert_eq!(
            stmt,
            "(IF (< (ID i) (INTEGER 0)) (:= (ID i) (INTEGER 1)) (:= (ID i) (INTEGER 2)))"
        );
    }

    #[test]
    fn indexing_a_scalar_is_diagnosed() {
        let parsed = parse(
            "program p(output); var i,v:integer; begin v := i[1] end.",
        );
        assert!(!parsed.diagnostics.is_empty());
    }

    #[test]
    fn dereferencing_a_scalar_is_diagnosed() {
        let parsed = parse("program p(output); var i,v:integer; begin v := i^ end.");
        assert!(!parsed.diagnostics.is_empty());
    }
}
