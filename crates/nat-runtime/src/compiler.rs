//! The single-pass compiler.
//!
//! A Pratt parser that resolves lexical scope (locals, upvalues, globals) and
//! emits bytecode in the same pass. Function compilers form a chain of states
//! in an arena; each paren-signature function also carries a sibling
//! signature compiler whose emitted code materializes a `Signature` value at
//! closure-creation time.
//!
//! Infix expression rules carry separate left and right precedences so both
//! left- and right-associative user operators work; for identifier tokens the
//! rule is recomputed on every infix check by consulting the VM's process-wide
//! infix map.

use crate::bytecode::Opcode;
use crate::diagnostic::{Diagnostic, DiagnosticAt};
use crate::object::{FunctionData, ObjData, ObjRef};
use crate::parser::Parser;
use crate::token::{Token, TokenKind};
use crate::value::{is_hashable, Value};
use crate::vm::Vm;

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;

type Prec = i32;

pub const PREC_NONE: Prec = 0;
pub const PREC_ASSIGNMENT: Prec = 1;
pub const PREC_TYPE_ASSIGNMENT: Prec = 2;
pub const PREC_OR: Prec = 3;
pub const PREC_AND: Prec = 4;
pub const PREC_EQUALITY: Prec = 5;
pub const PREC_COMPARISON: Prec = 6;
pub const PREC_FACTOR: Prec = 8;
pub const PREC_UNARY: Prec = 9;
pub const PREC_CALL: Prec = 10;
const PREC_STEP: Prec = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Module,
    Anonymous,
    /// A function bound to a name by `let` (names the function for traces).
    Bound,
    Method,
    Initializer,
    /// A function whose type-variable uses implicitly become parameters.
    Implicit,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// One function being compiled. States are never popped; `enclosing` links
/// form the lexical chain used by upvalue resolution.
struct FnState<'src> {
    enclosing: Option<usize>,
    fn_type: FunctionType,
    function: ObjRef,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

#[derive(Clone, Copy)]
enum Prefix {
    Parentheses,
    Braces,
    Brackets,
    Unary,
    Literal,
    Number,
    Str,
    Variable,
    Undef,
    Super,
    This,
    IfExpr,
}

#[derive(Clone, Copy)]
enum Infix {
    Call,
    Subscript,
    Dot,
    Binary,
    And,
    Or,
    User,
}

#[derive(Clone, Copy)]
struct Rule {
    prefix: Option<Prefix>,
    infix: Option<Infix>,
    left: Prec,
    right: Prec,
}

const NO_RULE: Rule = Rule {
    prefix: None,
    infix: None,
    left: PREC_NONE,
    right: PREC_NONE,
};

fn base_rule(kind: TokenKind) -> Rule {
    use TokenKind::*;
    match kind {
        LeftParen => Rule {
            prefix: Some(Prefix::Parentheses),
            infix: Some(self::Infix::Call),
            left: PREC_CALL,
            right: PREC_NONE,
        },
        LeftBrace => Rule {
            prefix: Some(Prefix::Braces),
            ..NO_RULE
        },
        LeftBracket => Rule {
            prefix: Some(Prefix::Brackets),
            infix: Some(self::Infix::Subscript),
            left: PREC_CALL,
            right: PREC_NONE,
        },
        Dot => Rule {
            infix: Some(self::Infix::Dot),
            left: PREC_CALL,
            ..NO_RULE
        },
        Bang => Rule {
            prefix: Some(Prefix::Unary),
            ..NO_RULE
        },
        BangEqual | EqualEqual => Rule {
            infix: Some(self::Infix::Binary),
            left: PREC_EQUALITY,
            right: PREC_EQUALITY + PREC_STEP,
            prefix: None,
        },
        In => Rule {
            infix: Some(self::Infix::Binary),
            left: PREC_COMPARISON,
            right: PREC_COMPARISON + PREC_STEP,
            prefix: None,
        },
        Identifier | TypeVariable => Rule {
            prefix: Some(Prefix::Variable),
            ..NO_RULE
        },
        String => Rule {
            prefix: Some(Prefix::Str),
            ..NO_RULE
        },
        Number => Rule {
            prefix: Some(Prefix::Number),
            ..NO_RULE
        },
        And => Rule {
            infix: Some(self::Infix::And),
            left: PREC_AND,
            ..NO_RULE
        },
        Or => Rule {
            infix: Some(self::Infix::Or),
            left: PREC_OR,
            ..NO_RULE
        },
        Undefined => Rule {
            prefix: Some(Prefix::Undef),
            ..NO_RULE
        },
        False | Nil | True => Rule {
            prefix: Some(Prefix::Literal),
            ..NO_RULE
        },
        Super => Rule {
            prefix: Some(Prefix::Super),
            ..NO_RULE
        },
        This => Rule {
            prefix: Some(Prefix::This),
            ..NO_RULE
        },
        If => Rule {
            prefix: Some(Prefix::IfExpr),
            ..NO_RULE
        },
        _ => NO_RULE,
    }
}

/// How `parse_delimited` decides to stop chaining infixes.
#[derive(Clone, Copy)]
enum Delimit {
    Never,
    /// Stop when the next token is preceded by whitespace (tree elements).
    PrevWhite,
}

impl Delimit {
    fn stops(self, parser: &Parser<'_>) -> bool {
        match self {
            Delimit::Never => false,
            Delimit::PrevWhite => parser.prev_white(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureType {
    Naked,
    Paren,
    Not,
}

#[derive(Debug, Clone, Copy)]
struct IterCtx {
    var: u16,
    iter: u16,
    loop_start: usize,
}

type Checkpoint<'src> = (Parser<'src>, usize);

pub struct Compiler<'src, 'vm> {
    vm: &'vm mut Vm,
    parser: Parser<'src>,
    states: Vec<FnState<'src>>,
    class_depth: usize,
    diagnostics: Vec<Diagnostic>,
}

/// Compile `source` as the module named `path`, returning the module
/// function or the batched compile errors.
pub fn compile<'src>(
    vm: &mut Vm,
    path: &'src str,
    source: &'src str,
) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut compiler = Compiler {
        vm,
        parser: Parser::new(source),
        states: Vec::new(),
        class_depth: 0,
        diagnostics: Vec::new(),
    };

    let c = compiler.init_compiler(None, FunctionType::Module, Token::synthetic(path));
    compiler.check_error_token(c);

    while !compiler.matches(c, TokenKind::Eof) {
        compiler.declaration(c);
    }

    let function = compiler.end_compiler(c);
    compiler.vm.compiler_roots.retain(|r| *r != function);

    if compiler.parser.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    // === Compiler states ===

    fn init_compiler(
        &mut self,
        enclosing: Option<usize>,
        fn_type: FunctionType,
        name: Token<'src>,
    ) -> usize {
        let function = self.vm.alloc(ObjData::Function(FunctionData::new()));
        // Root the function for the rest of this compilation.
        self.vm.compiler_roots.push(function);
        let name_ref = self.vm.intern(name.text);
        self.vm.heap.function_mut(function).name = Some(name_ref);

        let slot_zero = if matches!(fn_type, FunctionType::Method | FunctionType::Initializer) {
            Token::synthetic("this")
        } else {
            Token::synthetic("")
        };

        self.states.push(FnState {
            enclosing,
            fn_type,
            function,
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
        self.states.len() - 1
    }

    fn emit_default_return(&mut self, c: usize) {
        if self.states[c].fn_type == FunctionType::Initializer {
            self.emit_const_instr(c, Opcode::GetLocal, 0);
        } else {
            self.emit_op(c, Opcode::Nil);
        }
        self.emit_op(c, Opcode::ImplicitReturn);
    }

    fn end_compiler(&mut self, c: usize) -> ObjRef {
        self.emit_default_return(c);

        #[cfg(feature = "print-code")]
        if !self.parser.had_error {
            let function = self.states[c].function;
            let name = match self.vm.heap.function(function).name {
                Some(n) => self.vm.heap.string(n).to_string(),
                None => "<script>".to_string(),
            };
            eprintln!(
                "{}",
                crate::bytecode::disassemble_chunk(
                    &self.vm.heap,
                    &self.vm.heap.function(function).chunk,
                    &name
                )
            );
        }

        self.states[c].function
    }

    /// Finish `c` and load it in `enclosing` under `op` (`Closure`, `Sign`,
    /// …), followed by its upvalue pairs.
    fn close_function(&mut self, c: usize, enclosing: usize, op: Opcode) {
        let function = self.end_compiler(c);
        let constant = self.make_constant(enclosing, Value::Obj(function));
        self.emit_const_instr(enclosing, op, constant);
        self.emit_upvalue_pairs(c, enclosing);
        // The function is now a rooted constant of its enclosing function.
        self.vm.compiler_roots.retain(|r| *r != function);
    }

    /// Finish a signed function: the closure instruction for `c`, then the
    /// signature function under `Sign`.
    fn sign_function(&mut self, c: usize, sig: usize, enclosing: usize) {
        let function = self.end_compiler(c);
        let constant = self.make_constant(enclosing, Value::Obj(function));
        self.emit_const_instr(enclosing, Opcode::Closure, constant);
        self.emit_upvalue_pairs(c, enclosing);
        self.vm.compiler_roots.retain(|r| *r != function);

        self.close_function(sig, enclosing, Opcode::Sign);
    }

    fn emit_upvalue_pairs(&mut self, c: usize, enclosing: usize) {
        for i in 0..self.states[c].upvalues.len() {
            let upvalue = self.states[c].upvalues[i];
            self.emit_byte(enclosing, u8::from(upvalue.is_local));
            self.emit_byte(enclosing, upvalue.index);
        }
    }

    // === Emission ===

    fn chunk_count(&self, c: usize) -> usize {
        self.vm.heap.function(self.states[c].function).chunk.count()
    }

    fn emit_byte(&mut self, c: usize, byte: u8) {
        let line = self.parser.previous.line;
        let function = self.states[c].function;
        self.vm.heap.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, c: usize, op: Opcode) {
        self.emit_byte(c, op as u8);
    }

    fn emit_pair(&mut self, c: usize, a: u8, b: u8) {
        self.emit_byte(c, a);
        self.emit_byte(c, b);
    }

    fn emit_u16(&mut self, c: usize, value: u16) {
        self.emit_byte(c, (value >> 8) as u8);
        self.emit_byte(c, (value & 0xff) as u8);
    }

    fn emit_const_instr(&mut self, c: usize, op: Opcode, constant: u16) {
        self.emit_op(c, op);
        self.emit_u16(c, constant);
    }

    fn emit_jump(&mut self, c: usize, op: Opcode) -> usize {
        self.emit_op(c, op);
        self.emit_byte(c, 0xff);
        self.emit_byte(c, 0xff);
        self.chunk_count(c) - 2
    }

    fn patch_jump(&mut self, c: usize, offset: usize) {
        // -2 to adjust for the jump offset bytes themselves.
        let jump = self.chunk_count(c) - offset - 2;

        if jump > u16::MAX as usize {
            self.error(c, "Too much code to jump over.");
        }

        let function = self.states[c].function;
        let chunk = &mut self.vm.heap.function_mut(function).chunk;
        chunk.patch(offset, ((jump >> 8) & 0xff) as u8);
        chunk.patch(offset + 1, (jump & 0xff) as u8);
    }

    fn emit_loop(&mut self, c: usize, loop_start: usize) {
        self.emit_op(c, Opcode::Loop);

        let offset = self.chunk_count(c) - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error(c, "Loop body too large.");
        }

        self.emit_byte(c, ((offset >> 8) & 0xff) as u8);
        self.emit_byte(c, (offset & 0xff) as u8);
    }

    fn make_constant(&mut self, c: usize, value: Value) -> u16 {
        let function = self.states[c].function;
        let hashable = is_hashable(&self.vm.heap, value);

        if hashable {
            let hash = self.vm.hash(value);
            if let Some(Value::Number(existing)) =
                self.vm.heap.function(function).constants.get(value, hash)
            {
                return existing as u16;
            }
        }

        let index = self.vm.heap.function_mut(function).chunk.add_constant(value);
        if index > u16::MAX as usize {
            self.error(c, "Too many constants in one chunk.");
            return 0;
        }

        if hashable {
            let hash = self.vm.hash(value);
            self.vm
                .heap
                .function_mut(function)
                .constants
                .set(value, Value::Number(index as f64), hash);
        }

        index as u16
    }

    fn load_constant(&mut self, c: usize, value: Value) {
        let constant = self.make_constant(c, value);
        self.emit_const_instr(c, Opcode::Constant, constant);
    }

    fn identifier_constant(&mut self, c: usize, token: Token<'src>) -> u16 {
        let name = self.vm.intern(token.text);
        self.make_constant(c, Value::Obj(name))
    }

    fn get_global(&mut self, c: usize, name: &str) {
        let name = self.vm.intern(name);
        let constant = self.make_constant(c, Value::Obj(name));
        self.emit_const_instr(c, Opcode::GetGlobal, constant);
    }

    fn get_property_named(&mut self, c: usize, name: &str) {
        let name = self.vm.intern(name);
        let constant = self.make_constant(c, Value::Obj(name));
        self.emit_const_instr(c, Opcode::GetProperty, constant);
    }

    fn native_call(&mut self, c: usize, name: &str) {
        self.get_global(c, name);
        self.emit_pair(c, Opcode::Call as u8, 0);
    }

    fn native_postfix(&mut self, c: usize, name: &str, arg_count: u8) {
        self.get_global(c, name);
        self.emit_pair(c, Opcode::CallPostfix as u8, arg_count);
    }

    // === Errors ===

    fn error_at(&mut self, c: usize, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;

        let location = match self.vm.heap.function(self.states[c].function).name {
            Some(name) => self.vm.heap.string(name).to_string(),
            None => "script".to_string(),
        };
        let at = match token.kind {
            TokenKind::Eof => DiagnosticAt::End,
            TokenKind::Error => DiagnosticAt::Nowhere,
            _ => DiagnosticAt::Lexeme(token.text.to_string()),
        };

        self.diagnostics.push(Diagnostic {
            line: token.line,
            location,
            at,
            message: message.to_string(),
        });
    }

    fn error(&mut self, c: usize, message: &str) {
        let token = self.parser.previous;
        self.error_at(c, token, message);
    }

    fn error_at_current(&mut self, c: usize, message: &str) {
        let token = self.parser.current;
        self.error_at(c, token, message);
    }

    fn check_error_token(&mut self, c: usize) {
        if self.parser.current.kind == TokenKind::Error {
            let token = self.parser.current;
            self.error_at(c, token, token.text);
        }
    }

    // === Token plumbing ===

    fn advance(&mut self, c: usize) {
        self.parser.shift();
        self.check_error_token(c);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.check(kind)
    }

    fn matches(&mut self, c: usize, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance(c);
        true
    }

    fn consume(&mut self, c: usize, kind: TokenKind, message: &str) {
        if self.parser.check(kind) {
            self.advance(c);
        } else {
            self.error_at_current(c, message);
        }
    }

    fn consume_identifier(&mut self, c: usize, message: &str) {
        if self.parser.check_variable() {
            self.advance(c);
        } else {
            self.error_at_current(c, message);
        }
    }

    /// Speculation checkpoint: parser cursor plus diagnostic count.
    fn save(&self) -> Checkpoint<'src> {
        (self.parser, self.diagnostics.len())
    }

    /// Abandon a speculative parse entirely, dropping its diagnostics.
    fn restore(&mut self, checkpoint: Checkpoint<'src>) {
        self.parser = checkpoint.0;
        self.diagnostics.truncate(checkpoint.1);
    }

    /// Reposition the cursor of a committed parse (comprehension bodies),
    /// keeping any errors already recorded.
    fn rewind(&mut self, checkpoint: &Checkpoint<'src>) {
        let had_error = self.parser.had_error;
        let panic_mode = self.parser.panic_mode;
        self.parser = checkpoint.0;
        self.parser.had_error |= had_error;
        self.parser.panic_mode |= panic_mode;
    }

    /// Skip to a `target` token at the starting nesting depth, or stop at
    /// `closing` when the depth runs out.
    fn advance_to(
        &mut self,
        c: usize,
        target: TokenKind,
        closing: TokenKind,
        initial_depth: i32,
    ) -> bool {
        use TokenKind::*;
        let mut depth = initial_depth;

        loop {
            if self.check(Eof) {
                return false;
            }
            if self.check(LeftBrace) || self.check(LeftBracket) || self.check(LeftParen) {
                depth += 1;
            }
            if self.check(RightBrace) || self.check(RightBracket) || self.check(RightParen) {
                depth -= 1;
            }

            if self.check(target) && depth == initial_depth {
                return true;
            }
            if self.check(closing) && depth == 0 {
                return false;
            }

            self.advance(c);
        }
    }

    // === Scope ===

    fn begin_scope(&mut self, c: usize) {
        self.states[c].scope_depth += 1;
    }

    fn end_scope(&mut self, c: usize) {
        self.states[c].scope_depth -= 1;

        loop {
            let state = &self.states[c];
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(c, Opcode::CloseUpvalue);
            } else {
                self.emit_op(c, Opcode::Pop);
            }
            self.states[c].locals.pop();
        }
    }

    fn add_local(&mut self, c: usize, name: Token<'src>) -> u8 {
        if self.states[c].locals.len() == MAX_LOCALS {
            self.error(c, "Too many local variables in function.");
            return 0;
        }

        self.states[c].locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        (self.states[c].locals.len() - 1) as u8
    }

    fn mark_initialized(&mut self, c: usize) {
        let state = &mut self.states[c];
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn declare_local(&mut self, c: usize, name: Token<'src>) -> u8 {
        let state = &self.states[c];
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name.text == name.text {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error(c, "Already a variable with this name in this scope.");
        }

        self.add_local(c, name)
    }

    fn declare_variable(&mut self, c: usize) -> u8 {
        if self.states[c].scope_depth == 0 {
            return 0;
        }
        let name = self.parser.previous;
        self.declare_local(c, name)
    }

    fn resolve_local(&mut self, c: usize, name: &Token<'src>) -> Option<u8> {
        for i in (0..self.states[c].locals.len()).rev() {
            let local = self.states[c].locals[i];
            if local.name.text == name.text {
                if local.depth == -1 {
                    self.error(c, "Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, c: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.states[c].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }

        if self.states[c].upvalues.len() == MAX_UPVALUES {
            self.error(c, "Too many closure variables in function.");
            return 0;
        }

        self.states[c].upvalues.push(UpvalueDesc { index, is_local });
        let function = self.states[c].function;
        self.vm.heap.function_mut(function).upvalue_count = self.states[c].upvalues.len();
        (self.states[c].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, c: usize, name: &Token<'src>) -> Option<u8> {
        let enclosing = self.states[c].enclosing?;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(c, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(c, upvalue, false));
        }

        None
    }

    fn parse_variable(&mut self, c: usize, message: &str) -> u16 {
        self.consume_identifier(c, message);
        let local = self.declare_variable(c);

        if self.states[c].scope_depth > 0 {
            return u16::from(local);
        }

        let token = self.parser.previous;
        self.identifier_constant(c, token)
    }

    fn define_variable(&mut self, c: usize, var: u16) {
        if self.states[c].scope_depth > 0 {
            self.mark_initialized(c);
            return;
        }
        self.emit_const_instr(c, Opcode::DefineGlobal, var);
    }

    fn set_variable(&mut self, c: usize, var: u16) {
        if self.states[c].scope_depth > 0 {
            self.emit_const_instr(c, Opcode::SetLocal, var);
        } else {
            self.emit_const_instr(c, Opcode::SetGlobal, var);
        }
    }

    fn define_type(&mut self, c: usize, var: u16) {
        let op = if self.states[c].scope_depth > 0 {
            Opcode::SetTypeLocal
        } else {
            Opcode::SetTypeGlobal
        };
        self.emit_const_instr(c, op, var);
    }

    // === Expression rules ===

    fn infixable_rule(&mut self, c: usize, token: Token<'src>) -> Rule {
        let mut rule = base_rule(token.kind);

        // Identifiers are infix exactly when the process-wide infix map
        // says so; the sign of the precedence carries associativity.
        if token.kind == TokenKind::Identifier {
            let name = self.vm.intern(token.text);
            let key = Value::Obj(name);
            let hash = self.vm.heap.hash_of(name);

            match self.vm.infixes.get(key, hash) {
                Some(Value::Number(precedence)) => {
                    let precedence = precedence as Prec;
                    if precedence > 0 {
                        rule.left = precedence;
                        rule.right = precedence + PREC_STEP;
                        rule.infix = Some(Infix::User);
                    } else if precedence < 0 {
                        rule.left = -precedence;
                        rule.right = -precedence;
                        rule.infix = Some(Infix::User);
                    } else {
                        self.error(c, "Unexpected precedence");
                    }
                }
                _ => {
                    rule.infix = None;
                    rule.left = PREC_NONE;
                }
            }
        }

        rule
    }

    fn apply_prefix(&mut self, c: usize, prefix: Prefix, can_assign: bool) {
        match prefix {
            Prefix::Parentheses => self.parentheses(c, can_assign),
            Prefix::Braces => self.braces(c, can_assign),
            Prefix::Brackets => self.brackets(c, can_assign),
            Prefix::Unary => self.unary(c),
            Prefix::Literal => self.literal(c),
            Prefix::Number => self.number(c),
            Prefix::Str => self.string(c),
            Prefix::Variable => self.variable(c, can_assign),
            Prefix::Undef => self.emit_op(c, Opcode::Undefined),
            Prefix::Super => self.super_(c),
            Prefix::This => self.this_(c),
            Prefix::IfExpr => self.if_expression(c),
        }
    }

    fn apply_infix(&mut self, c: usize, infix: Infix, can_assign: bool) {
        match infix {
            Infix::Call => self.call(c),
            Infix::Subscript => self.subscript(c, can_assign),
            Infix::Dot => self.dot(c, can_assign),
            Infix::Binary => self.binary(c),
            Infix::And => self.and_(c),
            Infix::Or => self.or_(c),
            Infix::User => self.infix_apply(c, can_assign),
        }
    }

    fn parse_delimited(&mut self, c: usize, precedence: Prec, delimit: Delimit) {
        self.advance(c);

        let Some(prefix) = base_rule(self.parser.previous.kind).prefix else {
            self.error(c, "Expect expression.");
            return;
        };

        let can_assign = precedence <= PREC_ASSIGNMENT;
        self.apply_prefix(c, prefix, can_assign);

        loop {
            if delimit.stops(&self.parser) {
                break;
            }

            let current = self.parser.current;
            let rule = self.infixable_rule(c, current);
            if precedence > rule.left {
                break;
            }

            self.advance(c);
            match rule.infix {
                Some(infix) => self.apply_infix(c, infix, can_assign),
                None => {
                    self.error(c, "Expect expression.");
                    return;
                }
            }
        }

        if can_assign && self.matches(c, TokenKind::Equal) {
            self.error(c, "Invalid assignment target.");
        }
    }

    fn parse_precedence(&mut self, c: usize, precedence: Prec) {
        self.parse_delimited(c, precedence, Delimit::Never);
    }

    fn expression(&mut self, c: usize) {
        if self.try_function(c, FunctionType::Anonymous, Token::synthetic("lambda")) {
            return;
        }
        self.parse_precedence(c, PREC_ASSIGNMENT);
    }

    fn bound_expression(&mut self, c: usize, name: Token<'src>) {
        if self.try_function(c, FunctionType::Bound, name) {
            return;
        }
        self.parse_precedence(c, PREC_ASSIGNMENT);
    }

    fn white_delimited_expression(&mut self, c: usize) {
        if self.try_function(c, FunctionType::Anonymous, Token::synthetic("lambda")) {
            return;
        }
        self.parse_delimited(c, PREC_ASSIGNMENT, Delimit::PrevWhite);
    }

    fn type_expression(&mut self, c: usize) {
        // If there is explicit quantification, all type variables must be
        // explicit; only otherwise do free ones become implicit parameters.
        if self.try_function(c, FunctionType::Anonymous, Token::synthetic("lambda"))
            || self.try_implicit_function(c)
        {
            return;
        }
        self.parse_precedence(c, PREC_TYPE_ASSIGNMENT);
    }

    fn argument_list(&mut self, c: usize) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(c, TokenKind::DoubleDot) {
                    self.expression(c);
                    self.emit_op(c, Opcode::Spread);
                } else {
                    self.expression(c);
                }

                if arg_count == 255 {
                    self.error(c, "Can't have more than 255 arguments.");
                }
                arg_count += 1;

                if !self.matches(c, TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(c, TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    fn call(&mut self, c: usize) {
        let arg_count = self.argument_list(c);
        self.emit_pair(c, Opcode::Call as u8, arg_count);
    }

    fn subscript(&mut self, c: usize, can_assign: bool) {
        self.expression(c);
        self.consume(c, TokenKind::RightBracket, "Expect ']' after arguments.");

        if can_assign && self.matches(c, TokenKind::Equal) {
            self.expression(c);
            self.emit_op(c, Opcode::SubscriptSet);
        } else {
            self.emit_op(c, Opcode::SubscriptGet);
        }
    }

    fn property(&mut self, c: usize, can_assign: bool) {
        self.consume_identifier(c, "Expect property name after '.'.");
        let token = self.parser.previous;
        let name = self.identifier_constant(c, token);

        if can_assign && self.matches(c, TokenKind::Equal) {
            self.expression(c);
            self.emit_const_instr(c, Opcode::SetProperty, name);
        } else if self.matches(c, TokenKind::LeftParen) {
            // Property access followed by a call in one instruction.
            let arg_count = self.argument_list(c);
            self.emit_const_instr(c, Opcode::Invoke, name);
            self.emit_byte(c, arg_count);
        } else {
            self.emit_const_instr(c, Opcode::GetProperty, name);
        }
    }

    /// A dot flush against an expression is property access; a dot with
    /// whitespace on both sides is function composition.
    fn dot(&mut self, c: usize, can_assign: bool) {
        if self.parser.penult_white() && self.parser.prev_white() {
            self.get_global(c, "compose");
            self.expression(c);
            self.emit_op(c, Opcode::CallInfix);
        } else {
            self.property(c, can_assign);
        }
    }

    fn binary(&mut self, c: usize) {
        let operator = self.parser.previous;
        let rule = self.infixable_rule(c, operator);
        self.parse_precedence(c, rule.right);

        match operator.kind {
            TokenKind::BangEqual => {
                self.emit_op(c, Opcode::Equal);
                self.emit_op(c, Opcode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(c, Opcode::Equal),
            TokenKind::In => self.emit_op(c, Opcode::Member),
            _ => {}
        }
    }

    fn and_(&mut self, c: usize) {
        let end_jump = self.emit_jump(c, Opcode::JumpIfFalse);

        self.emit_op(c, Opcode::Pop);
        self.parse_precedence(c, PREC_AND);

        self.patch_jump(c, end_jump);
    }

    fn or_(&mut self, c: usize) {
        let else_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(c, Opcode::Jump);

        self.patch_jump(c, else_jump);
        self.emit_op(c, Opcode::Pop);

        self.parse_precedence(c, PREC_OR);
        self.patch_jump(c, end_jump);
    }

    fn number(&mut self, c: usize) {
        let value: f64 = self.parser.previous.text.parse().unwrap_or(0.0);
        self.load_constant(c, Value::Number(value));
    }

    fn string(&mut self, c: usize) {
        let text = self.parser.previous.text;
        let content = &text[1..text.len() - 1];
        let string = self.vm.intern(content);
        self.load_constant(c, Value::Obj(string));
    }

    fn literal(&mut self, c: usize) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(c, Opcode::False),
            TokenKind::Nil => self.emit_op(c, Opcode::Nil),
            TokenKind::True => self.emit_op(c, Opcode::True),
            _ => {}
        }
    }

    fn unary(&mut self, c: usize) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(c, PREC_UNARY);

        if operator == TokenKind::Bang {
            self.emit_op(c, Opcode::Not);
        }
    }

    fn parentheses(&mut self, c: usize, _can_assign: bool) {
        if self.matches(c, TokenKind::RightParen) {
            self.emit_op(c, Opcode::Unit);
            return;
        }

        self.expression(c);

        // A comma makes it a tuple.
        if self.check(TokenKind::Comma) {
            let mut arg_count: u8 = 1;
            while self.check(TokenKind::Comma) {
                self.advance(c);
                self.expression(c);
                arg_count = arg_count.saturating_add(1);
            }
            self.get_global(c, "Tuple");
            self.emit_pair(c, Opcode::CallPostfix as u8, arg_count);
        }
        self.consume(c, TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn named_variable(&mut self, c: usize, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(c, &name) {
            (Opcode::GetLocal, Opcode::SetLocal, u16::from(slot))
        } else if let Some(upvalue) = self.resolve_upvalue(c, &name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, u16::from(upvalue))
        } else {
            let constant = self.identifier_constant(c, name);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };

        if can_assign && self.matches(c, TokenKind::Equal) {
            self.bound_expression(c, name);
            self.emit_const_instr(c, set_op, arg);
        } else if can_assign && self.matches(c, TokenKind::Colon) {
            self.expression(c);
            self.define_type(c, arg);
        } else if can_assign && self.matches(c, TokenKind::ArrowLeft) {
            self.expression(c);
            self.emit_op(c, Opcode::Destructure);
            self.emit_const_instr(c, set_op, arg);
        } else {
            self.emit_const_instr(c, get_op, arg);
        }
    }

    fn variable(&mut self, c: usize, can_assign: bool) {
        let token = self.parser.previous;

        // Free type variables inside an implicit function become its
        // parameters.
        if token.kind == TokenKind::TypeVariable
            && self.states[c].fn_type == FunctionType::Implicit
            && self.resolve_local(c, &token).is_none()
        {
            let function = self.states[c].function;
            self.vm.heap.function_mut(function).arity += 1;
            self.declare_variable(c);
            self.mark_initialized(c);
        }

        self.named_variable(c, token, can_assign);
    }

    /// A user infix operator: load the operator's binding, then, if it is
    /// whitespace-applied, the right operand and an infix call.
    fn infix_apply(&mut self, c: usize, can_assign: bool) {
        let token = self.parser.previous;
        let rule = self.infixable_rule(c, token);

        self.variable(c, can_assign);

        if self.parser.penult_white() && self.parser.prev_white() {
            self.parse_precedence(c, rule.right);
            self.emit_op(c, Opcode::CallInfix);
        }
    }

    fn super_(&mut self, c: usize) {
        if self.class_depth == 0 {
            self.error(c, "Can't use 'super' outside of a class.");
        }

        self.consume(c, TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume_identifier(c, "Expect superclass method name.");
        let token = self.parser.previous;
        let name = self.identifier_constant(c, token);

        // Load the instance first; binding a method detached from the
        // superclass needs it.
        self.named_variable(c, Token::synthetic("this"), false);
        self.named_variable(c, Token::synthetic("super"), false);
        self.emit_const_instr(c, Opcode::GetSuper, name);
    }

    fn this_(&mut self, c: usize) {
        if self.class_depth == 0 {
            self.error(c, "Can't use 'this' outside of a class.");
            return;
        }
        self.variable(c, false);
    }

    /// `if` in expression position produces a value; the then-branch may be
    /// terminated by `;` before `else`.
    fn if_expression(&mut self, c: usize) {
        self.consume(c, TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(c);
        self.consume(c, TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        self.emit_op(c, Opcode::Pop);
        self.expression(c);
        self.matches(c, TokenKind::Semicolon);

        let else_jump = self.emit_jump(c, Opcode::Jump);
        self.patch_jump(c, then_jump);
        self.emit_op(c, Opcode::Pop);

        if self.matches(c, TokenKind::Else) {
            self.expression(c);
        } else {
            self.emit_op(c, Opcode::Nil);
        }
        self.patch_jump(c, else_jump);
    }

    // === Functions ===

    fn match_param_or_pattern(&mut self, c: usize) -> bool {
        use TokenKind::*;
        for kind in [Identifier, TypeVariable, Number, True, False, Nil, Undefined, String] {
            if self.matches(c, kind) {
                return true;
            }
        }
        false
    }

    /// Decide, purely by cursor movement, whether the upcoming tokens form
    /// a function signature. The caller restores the checkpoint.
    fn peek_signature_type(&mut self, c: usize) -> SignatureType {
        if self.matches(c, TokenKind::LeftParen) {
            if !self.check(TokenKind::RightParen) {
                loop {
                    if !self.match_param_or_pattern(c) {
                        return SignatureType::Not;
                    }
                    if self.check(TokenKind::Colon) {
                        self.advance_to(c, TokenKind::Comma, TokenKind::RightParen, 1);
                    }
                    if !self.matches(c, TokenKind::Comma) {
                        break;
                    }
                }
            }

            if !self.matches(c, TokenKind::RightParen) {
                return SignatureType::Not;
            }
            if !self.matches(c, TokenKind::FatArrow) {
                return SignatureType::Not;
            }

            SignatureType::Paren
        } else {
            // Can only be naked.
            if self.match_param_or_pattern(c) {
                return self.peek_signature_type(c);
            }
            if self.matches(c, TokenKind::FatArrow) {
                return SignatureType::Naked;
            }
            SignatureType::Not
        }
    }

    fn try_single_function(&mut self, c: usize, fn_type: FunctionType, name: Token<'src>) -> bool {
        let checkpoint = self.save();
        let signature_type = self.peek_signature_type(c);
        self.restore(checkpoint);

        match signature_type {
            SignatureType::Naked => {
                self.naked_function(c, fn_type, name);
                true
            }
            SignatureType::Paren => {
                self.function(c, fn_type, name);
                true
            }
            SignatureType::Not => false,
        }
    }

    fn overload(&mut self, c: usize, fn_type: FunctionType, name: Token<'src>) {
        let mut count: u8 = 1;

        loop {
            self.try_single_function(c, fn_type, name);
            count = count.saturating_add(1);
            if !self.matches(c, TokenKind::Pipe) {
                break;
            }
        }

        self.emit_pair(c, Opcode::Overload as u8, count);
    }

    fn try_function(&mut self, c: usize, fn_type: FunctionType, name: Token<'src>) -> bool {
        if self.try_single_function(c, fn_type, name) {
            if self.matches(c, TokenKind::Pipe) {
                self.overload(c, fn_type, name);
            }
            return true;
        }
        false
    }

    fn push_pattern(&mut self, c: usize, pattern: Option<Value>) {
        let function = self.states[c].function;
        self.vm.heap.function_mut(function).patterns.push(pattern);
    }

    /// A literal in a parameter position: emitted into the signature and
    /// recorded on the function for dispatch.
    fn pattern_literal(&mut self, c: usize, sig: usize) -> Option<Value> {
        if self.matches(c, TokenKind::Number) {
            let n: f64 = self.parser.previous.text.parse().unwrap_or(0.0);
            self.load_constant(sig, Value::Number(n));
            Some(Value::Number(n))
        } else if self.matches(c, TokenKind::String) {
            let text = self.parser.previous.text;
            let string = self.vm.intern(&text[1..text.len() - 1]);
            self.load_constant(sig, Value::Obj(string));
            Some(Value::Obj(string))
        } else if self.matches(c, TokenKind::True) {
            self.emit_op(sig, Opcode::True);
            Some(Value::Bool(true))
        } else if self.matches(c, TokenKind::False) {
            self.emit_op(sig, Opcode::False);
            Some(Value::Bool(false))
        } else if self.matches(c, TokenKind::Nil) {
            self.emit_op(sig, Opcode::Nil);
            Some(Value::Nil)
        } else if self.matches(c, TokenKind::Undefined) {
            self.emit_op(sig, Opcode::Undefined);
            Some(Value::Undefined)
        } else {
            self.error_at_current(c, "Expect parameter or pattern.");
            None
        }
    }

    fn parameter(&mut self, c: usize, sig: usize) {
        self.get_global(sig, "PatternElement");

        if self.parser.check_variable() {
            self.advance(c);
            self.declare_variable(c);
            self.mark_initialized(c);
            self.push_pattern(c, None);

            // Include the parameter in the signature.
            self.get_global(sig, "Variable");
            let token = self.parser.previous;
            let constant = self.identifier_constant(sig, token);
            self.emit_const_instr(sig, Opcode::Constant, constant);
            self.emit_pair(sig, Opcode::Call as u8, 1);

            // Type.
            if self.matches(sig, TokenKind::Colon) {
                self.expression(sig);
            } else {
                self.emit_op(sig, Opcode::Undefined);
            }
        } else {
            let function = self.states[c].function;
            self.vm.heap.function_mut(function).patterned = true;

            // Include the literal in the signature; the type defaults
            // downstream to a type variable.
            let pattern = self.pattern_literal(c, sig);
            self.push_pattern(c, pattern);
            self.emit_op(sig, Opcode::Undefined);

            // Offset the local stack so that the literal can be passed to
            // the function as an argument even though it's not bound.
            self.add_local(c, Token::synthetic("#pattern"));
        }

        self.emit_pair(sig, Opcode::Call as u8, 2);
    }

    fn function(&mut self, enclosing: usize, fn_type: FunctionType, name: Token<'src>) {
        let sig = self.init_compiler(
            Some(enclosing),
            FunctionType::Implicit,
            Token::synthetic("signature"),
        );
        self.begin_scope(sig);

        let c = self.init_compiler(Some(enclosing), fn_type, name);
        self.begin_scope(c);

        self.consume(c, TokenKind::LeftParen, "Expect '(' after function name.");

        self.get_global(sig, "Signature");

        // Domain pattern.
        self.get_global(sig, "Pattern");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.states[c].function;
                if self.vm.heap.function(function).variadic {
                    self.error(c, "Can only apply * to the final parameter.");
                }

                let arity = {
                    let data = self.vm.heap.function_mut(function);
                    data.arity += 1;
                    data.arity
                };
                if arity > 255 {
                    self.error_at_current(c, "Can't have more than 255 parameters.");
                }

                if self.parser.check_str("*") {
                    self.vm.heap.function_mut(function).variadic = true;
                    // Shift the star off the parameter's token.
                    let current = &mut self.parser.current;
                    current.text = &current.text[1..];
                    current.start += 1;
                }

                self.parameter(c, sig);
                if !self.matches(c, TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(c, TokenKind::RightParen, "Expect ')' after parameters.");

        let arity = self.vm.heap.function(self.states[c].function).arity.min(255) as u8;
        self.emit_pair(sig, Opcode::Call as u8, arity);
        // Range pattern.
        self.get_global(sig, "Pattern");
        self.emit_pair(sig, Opcode::Call as u8, 0);
        self.consume(c, TokenKind::FatArrow, "Expect '=>' after signature.");
        // Signature.
        self.emit_pair(sig, Opcode::Call as u8, 2);
        self.emit_op(sig, Opcode::Return);

        self.block_or_expression(c);

        self.sign_function(c, sig, enclosing);
    }

    fn naked_function(&mut self, enclosing: usize, fn_type: FunctionType, name: Token<'src>) {
        let sig = self.init_compiler(
            Some(enclosing),
            FunctionType::Implicit,
            Token::synthetic("signature"),
        );
        self.begin_scope(sig);

        let c = self.init_compiler(Some(enclosing), fn_type, name);
        self.begin_scope(c);

        self.get_global(sig, "Signature");

        self.vm
            .heap
            .function_mut(self.states[c].function)
            .arity = 1;

        self.get_global(sig, "Pattern");
        self.parameter(c, sig);
        // Domain pattern.
        self.emit_pair(sig, Opcode::Call as u8, 1);

        if self.check(TokenKind::FatArrow) {
            self.advance(c);
            self.block_or_expression(c);
        } else {
            // Currying: further naked parameters nest a closure per step.
            self.naked_function(c, FunctionType::Anonymous, Token::synthetic("lambda"));
            self.emit_op(c, Opcode::Return);
        }

        // Range pattern.
        self.get_global(sig, "Pattern");
        self.emit_pair(sig, Opcode::Call as u8, 0);
        // Signature.
        self.emit_pair(sig, Opcode::Call as u8, 2);
        self.emit_op(sig, Opcode::Return);

        self.sign_function(c, sig, enclosing);
    }

    /// Compile a type expression as a function whose parameters are its
    /// free type variables; discarded when no variables occur.
    fn try_implicit_function(&mut self, enclosing: usize) -> bool {
        let checkpoint = self.save();

        let c = self.init_compiler(
            Some(enclosing),
            FunctionType::Implicit,
            Token::synthetic("implicit"),
        );
        self.begin_scope(c);

        self.parse_precedence(c, PREC_TYPE_ASSIGNMENT);

        if self.vm.heap.function(self.states[c].function).arity > 0 {
            self.emit_op(c, Opcode::Return);
            self.close_function(c, enclosing, Opcode::Closure);
            return true;
        }

        // No parameters: discard the function and rewind.
        let function = self.states[c].function;
        self.vm.compiler_roots.retain(|r| *r != function);
        self.restore(checkpoint);
        false
    }

    fn block(&mut self, c: usize) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(c);
        }
        self.consume(c, TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn block_or_expression(&mut self, c: usize) {
        if self.check(TokenKind::LeftBrace) {
            self.advance(c);
            self.block(c);
        } else {
            self.expression(c);
            self.emit_op(c, Opcode::Return);
        }
    }

    // === Iteration and comprehensions ===

    fn iterator(&mut self, c: usize) -> IterCtx {
        // The bound variable.
        let var = self.parse_variable(c, "Expect identifier.");
        self.emit_op(c, Opcode::Nil);
        self.define_variable(c, var);

        self.consume(c, TokenKind::In, "Expect 'in' between identifier and iterable.");

        // The potentially iterable expression, turned into an iterator.
        self.expression(c);
        self.get_global(c, "iter");
        self.emit_pair(c, Opcode::CallPostfix as u8, 1);
        let iter = u16::from(self.add_local(c, Token::synthetic("#iter")));
        self.mark_initialized(c);

        let loop_start = self.chunk_count(c);

        IterCtx { var, iter, loop_start }
    }

    fn iteration_next(&mut self, c: usize, iter: &IterCtx) -> usize {
        // more().
        self.emit_const_instr(c, Opcode::GetLocal, iter.iter);
        self.get_property_named(c, "more");
        self.emit_pair(c, Opcode::Call as u8, 0);

        // Jump out of the loop when exhausted.
        let exit_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        self.emit_op(c, Opcode::Pop);

        // next().
        self.emit_const_instr(c, Opcode::GetLocal, iter.iter);
        self.get_property_named(c, "next");
        self.emit_pair(c, Opcode::Call as u8, 0);
        self.emit_const_instr(c, Opcode::SetLocal, iter.var);
        self.emit_op(c, Opcode::Pop);

        exit_jump
    }

    fn iteration_end(&mut self, c: usize, iter: &IterCtx, exit_jump: usize) {
        self.emit_loop(c, iter.loop_start);
        self.patch_jump(c, exit_jump);
        self.emit_op(c, Opcode::Pop);
    }

    /// Parse one comprehension clause (and, recursively, those to its
    /// right), then the body. Returns the checkpoint just past the clauses.
    fn comprehension(
        &mut self,
        c: usize,
        body: Checkpoint<'src>,
        var: u16,
        closing: TokenKind,
    ) -> Checkpoint<'src> {
        let mut iter_ctx = None;
        let mut iter_jump = None;
        let mut pred_jump = None;
        let mut end = body;

        if self.parser.check_variable() && self.parser.peek(TokenKind::In) {
            // A bound variable and an iterable to draw from.
            self.begin_scope(c);
            let ctx = self.iterator(c);
            iter_jump = Some(self.iteration_next(c, &ctx));
            iter_ctx = Some(ctx);
        } else {
            // A predicate to test against.
            self.expression(c);
            pred_jump = Some(self.emit_jump(c, Opcode::JumpIfFalse));
            self.emit_op(c, Opcode::Pop);
        }

        if self.matches(c, TokenKind::Comma) {
            // Recurse so every bound variable is in scope for the clauses
            // to its right; each scope concludes below.
            end = self.comprehension(c, body, var, closing);
        } else if self.check(closing) {
            // Save where the clauses end, then rewind to the body.
            end = self.save();
            self.rewind(&body);

            // Compute the element and append it to the comprehension.
            self.expression(c);
            self.emit_const_instr(c, Opcode::GetLocal, var);
            self.get_property_named(c, "add");
            self.emit_pair(c, Opcode::CallPostfix as u8, 1);
            self.emit_op(c, Opcode::Pop);
        }

        if let (Some(ctx), Some(jump)) = (iter_ctx, iter_jump) {
            self.iteration_end(c, &ctx, jump);
            self.end_scope(c);
        } else if let Some(pred) = pred_jump {
            // Jump over the pop of a truthy condition.
            let else_jump = self.emit_jump(c, Opcode::Jump);
            self.patch_jump(c, pred);
            self.emit_op(c, Opcode::Pop);
            self.patch_jump(c, else_jump);
        }

        end
    }

    /// If the bracketed/braced expression has a top-level `|`, compile it as
    /// a comprehension: a closure that builds the collection in its own
    /// frame and is invoked immediately.
    fn try_comprehension(&mut self, enclosing: usize, class_name: &str, closing: TokenKind) -> bool {
        let start = self.save();

        if self.advance_to(enclosing, TokenKind::Pipe, closing, 1) {
            self.advance(enclosing); // eat the pipe

            let c = self.init_compiler(
                Some(enclosing),
                FunctionType::Anonymous,
                Token::synthetic("#comprehension"),
            );
            self.begin_scope(c);

            // The collection under construction lives at a fixed local.
            self.native_call(c, class_name);
            let var = u16::from(self.add_local(c, Token::synthetic("#comprehension")));
            self.mark_initialized(c);

            let end = self.comprehension(c, start, var, closing);

            self.emit_op(c, Opcode::Return);
            self.close_function(c, enclosing, Opcode::Closure);
            self.emit_pair(enclosing, Opcode::Call as u8, 0);

            // Pick up at the end of the expression.
            self.rewind(&end);
            return true;
        }

        self.restore(start);
        false
    }

    // === Collection literals ===

    /// A map literal, set literal, or set comprehension.
    fn braces(&mut self, c: usize, _can_assign: bool) {
        // Empty braces is an empty set.
        if self.check(TokenKind::RightBrace) {
            self.advance(c);
            self.native_call(c, "Set");
            return;
        }

        if self.try_comprehension(c, "Set", TokenKind::RightBrace) {
            self.consume(c, TokenKind::RightBrace, "Expect closing '}'.");
            return;
        }

        // First element: either a map key or a set element.
        self.expression(c);
        let mut elements: u8 = 1;

        if self.check(TokenKind::RightBrace) {
            // A singleton set.
            self.native_postfix(c, "Set", elements);
        } else if self.check(TokenKind::Comma) {
            self.advance(c);
            loop {
                self.expression(c);
                elements = elements.saturating_add(1);
                if !self.matches(c, TokenKind::Comma) {
                    break;
                }
            }
            self.native_postfix(c, "Set", elements);
        } else if self.check(TokenKind::Colon) {
            // A map; each entry is a 2-tuple.
            self.advance(c);
            self.expression(c);
            self.native_postfix(c, "Tuple", 2);

            while self.matches(c, TokenKind::Comma) {
                self.expression(c);
                self.consume(c, TokenKind::Colon, "Expect ':' after map key.");
                self.expression(c);
                self.native_postfix(c, "Tuple", 2);
                elements = elements.saturating_add(1);
            }

            self.native_postfix(c, "Map", elements);
        }

        self.consume(c, TokenKind::RightBrace, "Expect closing '}'.");
    }

    /// Parse a sequence literal or comprehension if appropriate.
    fn sequence_literal(&mut self, c: usize) -> bool {
        if self.check(TokenKind::RightBracket) {
            self.native_call(c, "Sequence");
            return true;
        }

        if self.try_comprehension(c, "Sequence", TokenKind::RightBracket) {
            return true;
        }

        // First datum: could be a tree node or a sequence element.
        self.white_delimited_expression(c);

        if self.check(TokenKind::RightBracket) {
            self.native_postfix(c, "Sequence", 1);
            return true;
        }

        if self.matches(c, TokenKind::Comma) {
            let mut elements: u8 = 1;
            loop {
                self.expression(c);
                elements = elements.saturating_add(1);
                if !self.matches(c, TokenKind::Comma) {
                    break;
                }
            }
            self.native_postfix(c, "Sequence", elements);
            return true;
        }

        false
    }

    /// Whitespace-delimited elements with no commas form a tree: the first
    /// is the root, the rest its children.
    fn tree(&mut self, c: usize) {
        // The sequence check already parsed the first element.
        let mut elements: u8 = 1;
        self.native_postfix(c, "Node", 1);

        while !self.check(TokenKind::RightBracket) && !self.check(TokenKind::Eof) {
            self.white_delimited_expression(c);
            self.native_postfix(c, "Node", 1);
            elements = elements.saturating_add(1);
        }

        self.native_postfix(c, "Root", elements);
    }

    /// A sequence literal, sequence comprehension, or tree.
    fn brackets(&mut self, c: usize, _can_assign: bool) {
        if !self.sequence_literal(c) {
            self.tree(c);
        }
        self.consume(c, TokenKind::RightBracket, "Expect closing ']'.");
    }

    // === Declarations ===

    fn method(&mut self, c: usize) {
        self.consume_identifier(c, "Expect method name.");
        let name = self.parser.previous;
        let constant = self.identifier_constant(c, name);

        let fn_type = if name.text == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };

        self.function(c, fn_type, name);
        self.emit_const_instr(c, Opcode::Method, constant);

        if !self.parser.prev(TokenKind::RightBrace) {
            self.consume(
                c,
                TokenKind::Semicolon,
                "Expect ';' after method with expression body.",
            );
        }
    }

    fn class_declaration(&mut self, c: usize) {
        self.consume_identifier(c, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(c, class_name);
        self.declare_variable(c);

        self.emit_const_instr(c, Opcode::Class, name_constant);
        self.define_variable(c, name_constant);

        self.class_depth += 1;

        if self.matches(c, TokenKind::Extends) {
            self.consume_identifier(c, "Expect superclass name.");
            self.variable(c, false);

            if class_name.text == self.parser.previous.text {
                self.error(c, "A class can't inherit from itself.");
            }
        } else {
            // All classes inherit from Object unless they say otherwise.
            self.get_global(c, "Object");
        }

        // "super" gets its own scope so adjacent class declarations don't
        // clash.
        self.begin_scope(c);
        self.add_local(c, Token::synthetic("super"));
        self.define_variable(c, 0);

        self.named_variable(c, class_name, false);
        self.emit_op(c, Opcode::Inherit);

        self.named_variable(c, class_name, false);

        self.consume(c, TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(c);
        }
        self.consume(c, TokenKind::RightBrace, "Expect '}' after class body.");

        // Pop the class value.
        self.emit_op(c, Opcode::Pop);
        self.end_scope(c);

        self.class_depth -= 1;
    }

    /// Parse an infix declaration's precedence; defaults to factor level.
    fn precedence(&mut self, c: usize) -> Prec {
        if self.states[c].scope_depth > 0 {
            self.error(c, "Can only infix globals.");
        }
        self.advance(c);

        let mut precedence = PREC_FACTOR;
        if self.check(TokenKind::LeftParen) {
            self.advance(c);
            self.consume(c, TokenKind::Number, "Expect numeral precedence.");
            precedence = self.parser.previous.text.parse::<f64>().unwrap_or(0.0) as Prec;
            if precedence == 0 {
                self.error(c, "Precedence must be > 0.");
            }
            self.consume(c, TokenKind::RightParen, "Expect closing ')'.");
        }
        precedence
    }

    fn let_declaration(&mut self, c: usize) {
        // Associativity defaults to left, so `infixl` is vacuous, but it's
        // supported for symmetry.
        let mut infix_precedence: Prec = 0;
        if self.check(TokenKind::Infix) || self.check(TokenKind::InfixLeft) {
            infix_precedence = self.precedence(c);
        } else if self.check(TokenKind::InfixRight) {
            infix_precedence = -self.precedence(c);
        }

        let var = self.parse_variable(c, "Expect variable name.");
        let name = self.parser.previous;
        self.emit_op(c, Opcode::Undefined);
        self.define_variable(c, var);

        let mut annotated = false;
        if self.matches(c, TokenKind::Colon) {
            self.type_expression(c);
            annotated = true;
        }

        if self.matches(c, TokenKind::Equal) {
            self.bound_expression(c, name);
        } else if self.matches(c, TokenKind::ArrowLeft) {
            self.expression(c);
            self.emit_op(c, Opcode::Destructure);
        } else {
            self.emit_op(c, Opcode::Nil);
        }

        self.set_variable(c, var);
        self.emit_op(c, Opcode::Pop);

        if annotated {
            // After the value assignment, so the type lands on the value.
            self.define_type(c, var);
            self.emit_op(c, Opcode::Pop);
        }

        if infix_precedence != 0 {
            let operator = self.vm.intern(name.text);
            let hash = self.vm.heap.hash_of(operator);
            self.vm.infixes.set(
                Value::Obj(operator),
                Value::Number(f64::from(infix_precedence)),
                hash,
            );
        }
    }

    fn single_let_declaration(&mut self, c: usize) {
        self.let_declaration(c);
        self.consume(
            c,
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
    }

    fn multi_let_declaration(&mut self, c: usize) {
        loop {
            self.let_declaration(c);
            if !self.matches(c, TokenKind::Comma) {
                break;
            }
        }
        self.consume(
            c,
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
    }

    fn const_declaration(&mut self, c: usize) {
        loop {
            let var = self.parse_variable(c, "Expect constant name.");
            let name = self.parser.previous;

            let symbol = self.vm.intern(name.text);
            self.load_constant(c, Value::Obj(symbol));
            self.define_variable(c, var);

            if !self.matches(c, TokenKind::Comma) {
                break;
            }
        }

        self.consume(
            c,
            TokenKind::Semicolon,
            "Expect ';' after constant declaration.",
        );
    }

    fn dom_declaration(&mut self, c: usize) {
        let var = self.parse_variable(c, "Expect domain name.");
        let name = self.parser.previous;
        self.emit_op(c, Opcode::Undefined);
        self.define_variable(c, var);

        self.consume(c, TokenKind::Equal, "Expect domain assignment.");
        self.get_global(c, "Domain");
        let name_ref = self.vm.intern(name.text);
        self.load_constant(c, Value::Obj(name_ref));
        self.consume(c, TokenKind::LeftBrace, "Expect domain elements.");
        self.braces(c, false);

        self.emit_pair(c, Opcode::Call as u8, 2);

        self.set_variable(c, var);
        self.emit_op(c, Opcode::Pop);
        self.consume(c, TokenKind::Semicolon, "Expect ';' after domain declaration.");
    }

    fn import_statement(&mut self, c: usize) {
        self.advance(c); // 'import'
        self.consume_identifier(c, "Expect path to import.");
        let path = self.parser.previous.text.to_string();

        // `as` and `from` clauses are accepted and ignored: modules execute
        // into the shared global namespace.
        if self.matches(c, TokenKind::As) {
            self.consume_identifier(c, "Expect name after 'as'.");
        }
        if self.check(TokenKind::Identifier) && self.parser.current.text == "from" {
            self.advance(c);
            self.consume_identifier(c, "Expect module name after 'from'.");
        }
        self.consume(c, TokenKind::Semicolon, "Expect ';' after import.");

        let source = match self.vm.load_module_source(&path) {
            Ok(source) => source,
            Err(_) => {
                self.error(c, &format!("Could not open module '{path}'."));
                return;
            }
        };

        // Compile the module in its own parser; its diagnostics join ours.
        match compile(self.vm, &path, &source) {
            Ok(module) => {
                let constant = self.make_constant(c, Value::Obj(module));
                self.emit_const_instr(c, Opcode::Import, constant);
            }
            Err(diagnostics) => {
                self.diagnostics.extend(diagnostics);
                self.parser.had_error = true;
            }
        }
    }

    // === Statements ===

    fn expression_statement(&mut self, c: usize) {
        self.expression(c);
        self.consume(c, TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(c, Opcode::ExprStatement);
    }

    fn print_statement(&mut self, c: usize) {
        self.expression(c);
        self.consume(c, TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(c, Opcode::Print);
    }

    fn return_statement(&mut self, c: usize) {
        if self.states[c].fn_type == FunctionType::Module {
            self.error(c, "Can't return from top-level code.");
        }
        if self.states[c].fn_type == FunctionType::Initializer {
            self.error(c, "Can't return from an initializer.");
        }

        if self.matches(c, TokenKind::Semicolon) {
            self.emit_op(c, Opcode::Nil);
        } else {
            self.expression(c);
            self.consume(c, TokenKind::Semicolon, "Expect ';' after return value.");
        }

        self.emit_op(c, Opcode::Return);
    }

    fn throw_statement(&mut self, c: usize) {
        self.expression(c);
        self.emit_op(c, Opcode::Throw);
        self.consume(c, TokenKind::Semicolon, "Expect ';' after statement.");
    }

    fn if_statement(&mut self, c: usize) {
        self.consume(c, TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(c);
        self.consume(c, TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        self.emit_op(c, Opcode::Pop);

        self.statement(c);
        let else_jump = self.emit_jump(c, Opcode::Jump);

        self.patch_jump(c, then_jump);
        self.emit_op(c, Opcode::Pop);

        if self.matches(c, TokenKind::Else) {
            self.statement(c);
        }
        self.patch_jump(c, else_jump);
    }

    fn while_statement(&mut self, c: usize) {
        let loop_start = self.chunk_count(c);

        self.consume(c, TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(c);
        self.consume(c, TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        self.emit_op(c, Opcode::Pop);
        self.statement(c);
        self.emit_loop(c, loop_start);

        self.patch_jump(c, exit_jump);
        self.emit_op(c, Opcode::Pop);
    }

    fn loop_condition(&mut self, c: usize) -> usize {
        self.expression(c);
        self.consume(c, TokenKind::Semicolon, "Expect ';' after loop condition.");

        let exit_jump = self.emit_jump(c, Opcode::JumpIfFalse);
        self.emit_op(c, Opcode::Pop);

        exit_jump
    }

    fn loop_increment(&mut self, c: usize, loop_start: usize) -> usize {
        let body_jump = self.emit_jump(c, Opcode::Jump);
        let increment_start = self.chunk_count(c);
        self.expression(c);
        self.emit_op(c, Opcode::Pop);
        self.consume(c, TokenKind::RightParen, "Expect ')' after for clause.");

        self.emit_loop(c, loop_start);
        self.patch_jump(c, body_jump);

        increment_start
    }

    fn for_condition_statement(&mut self, c: usize) {
        if self.matches(c, TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(c, TokenKind::Let) {
            self.single_let_declaration(c);
        } else {
            self.expression_statement(c);
        }

        let mut loop_start = self.chunk_count(c);
        let exit_jump = if self.matches(c, TokenKind::Semicolon) {
            None
        } else {
            Some(self.loop_condition(c))
        };

        if !self.matches(c, TokenKind::RightParen) {
            loop_start = self.loop_increment(c, loop_start);
        }

        self.statement(c);
        self.emit_loop(c, loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(c, exit);
            self.emit_op(c, Opcode::Pop);
        }
    }

    fn for_in_statement(&mut self, c: usize) {
        let iter = self.iterator(c);
        self.consume(c, TokenKind::RightParen, "Expect ')' after for clause.");
        let exit_jump = self.iteration_next(c, &iter);
        self.statement(c);
        self.iteration_end(c, &iter, exit_jump);
    }

    fn for_statement(&mut self, c: usize) {
        self.begin_scope(c);
        self.consume(c, TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.parser.check_variable() {
            self.for_in_statement(c);
        } else {
            self.for_condition_statement(c);
        }

        self.end_scope(c);
    }

    fn synchronize(&mut self, c: usize) {
        self.parser.panic_mode = false;

        while !self.check(TokenKind::Eof) {
            if self.parser.prev(TokenKind::Semicolon) {
                return;
            }

            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::For
                | TokenKind::If
                | TokenKind::Let
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }

            self.advance(c);
        }
    }

    fn declaration(&mut self, c: usize) {
        if self.matches(c, TokenKind::Class) {
            self.class_declaration(c);
        } else if self.matches(c, TokenKind::Let) {
            self.multi_let_declaration(c);
        } else if self.matches(c, TokenKind::Const) {
            self.const_declaration(c);
        } else if self.matches(c, TokenKind::Dom) {
            self.dom_declaration(c);
        } else {
            self.statement(c);
        }

        if self.parser.panic_mode {
            self.synchronize(c);
        }
    }

    fn statement(&mut self, c: usize) {
        if self.matches(c, TokenKind::For) {
            self.for_statement(c);
        } else if self.matches(c, TokenKind::If) {
            self.if_statement(c);
        } else if self.check(TokenKind::Import) {
            self.import_statement(c);
        } else if self.matches(c, TokenKind::LeftBrace) {
            self.begin_scope(c);
            self.block(c);
            self.end_scope(c);
        } else if self.matches(c, TokenKind::Print) {
            self.print_statement(c);
        } else if self.matches(c, TokenKind::Return) {
            self.return_statement(c);
        } else if self.matches(c, TokenKind::Throw) {
            self.throw_statement(c);
        } else if self.matches(c, TokenKind::While) {
            self.while_statement(c);
        } else {
            self.expression_statement(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Operands;
    use crate::memory::Heap;
    use crate::module_loader::SourceMap;
    use crate::vm::SharedOutput;

    fn compile_module(source: &str) -> (Vm, ObjRef) {
        let mut vm = Vm::with(Box::new(SourceMap::new()), Box::new(SharedOutput::new()))
            .expect("core initialization");
        let function = compile(&mut vm, "main", source).expect("compiles");
        (vm, function)
    }

    /// Walk a chunk by the declared operand widths, checking every decoded
    /// byte is a known opcode and that instruction lengths tile the chunk
    /// exactly.
    fn walk_chunk(heap: &Heap, function: ObjRef) -> Vec<Opcode> {
        let chunk = &heap.function(function).chunk;
        let mut ops = Vec::new();
        let mut offset = 0;

        while offset < chunk.count() {
            let op = Opcode::from_byte(chunk.byte(offset)).expect("known opcode");
            ops.push(op);
            offset += 1;
            match op.operands() {
                Operands::None => {}
                Operands::Byte => offset += 1,
                Operands::Short | Operands::Constant | Operands::Jump => offset += 2,
                Operands::Invoke => offset += 3,
                Operands::Closure => {
                    let constant = chunk.short(offset) as usize;
                    offset += 2;
                    let inner = chunk.constants[constant]
                        .as_obj()
                        .expect("function constant");
                    offset += 2 * heap.function(inner).upvalue_count;
                }
            }
        }

        assert_eq!(offset, chunk.count(), "operand widths tile the chunk");
        ops
    }

    /// Every function reachable from the module through closure constants.
    fn all_functions(heap: &Heap, root: ObjRef) -> Vec<ObjRef> {
        let mut found = vec![root];
        let mut i = 0;
        while i < found.len() {
            let function = found[i];
            for value in &heap.function(function).chunk.constants {
                if let Some(r) = value.as_obj() {
                    if matches!(heap.get(r), crate::object::ObjData::Function(_))
                        && !found.contains(&r)
                    {
                        found.push(r);
                    }
                }
            }
            i += 1;
        }
        found
    }

    #[test]
    fn operand_widths_tile_every_chunk() {
        let (vm, module) = compile_module(
            "let x = 1; \
             let f = (n) => if (n == 0) 1; else n * f(n - 1); \
             class A { m() => 1; } \
             print f(5) + A().m();",
        );
        for function in all_functions(vm.heap(), module) {
            walk_chunk(vm.heap(), function);
        }
    }

    #[test]
    fn module_chunks_end_with_an_implicit_return() {
        let (vm, module) = compile_module("let x = 1;");
        let ops = walk_chunk(vm.heap(), module);
        assert_eq!(
            &ops[ops.len() - 2..],
            &[Opcode::Nil, Opcode::ImplicitReturn]
        );
    }

    #[test]
    fn closures_carry_one_pair_per_upvalue() {
        let (vm, module) = compile_module("let mk = (n) => () => n;");

        for function in all_functions(vm.heap(), module) {
            let chunk = &vm.heap().function(function).chunk;
            let mut offset = 0;
            while offset < chunk.count() {
                let op = Opcode::from_byte(chunk.byte(offset)).expect("known opcode");
                let next = match op.operands() {
                    Operands::None => offset + 1,
                    Operands::Byte => offset + 2,
                    Operands::Short | Operands::Constant | Operands::Jump => offset + 3,
                    Operands::Invoke => offset + 4,
                    Operands::Closure => {
                        let constant = chunk.short(offset + 1) as usize;
                        let inner = chunk.constants[constant]
                            .as_obj()
                            .expect("function constant");
                        let pairs = vm.heap().function(inner).upvalue_count;
                        // The operand stream carries exactly 2 bytes per
                        // upvalue after the constant index.
                        for pair in 0..pairs {
                            let is_local = chunk.byte(offset + 3 + 2 * pair);
                            assert!(is_local <= 1);
                        }
                        offset + 3 + 2 * pairs
                    }
                };
                offset = next;
            }
        }

        // The inner lambda captures exactly one upvalue.
        let captured = all_functions(vm.heap(), module)
            .iter()
            .map(|f| vm.heap().function(*f).upvalue_count)
            .max()
            .unwrap_or(0);
        assert_eq!(captured, 1);
    }

    #[test]
    fn constants_are_deduplicated() {
        let (vm, module) = compile_module("print 7 + 7 + 7;");
        let constants = &vm.heap().function(module).chunk.constants;
        let sevens = constants
            .iter()
            .filter(|v| **v == Value::Number(7.0))
            .count();
        assert_eq!(sevens, 1);
    }

    #[test]
    fn compile_errors_batch_and_resynchronize() {
        let mut vm = Vm::with(Box::new(SourceMap::new()), Box::new(SharedOutput::new()))
            .expect("core initialization");
        let diagnostics = compile(&mut vm, "main", "let = 1; let = 2;").unwrap_err();
        // One error per statement: panic mode suppresses the cascade, and
        // the synchronize point re-arms it at the next declaration.
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].message.contains("Expect variable name."));
    }

    #[test]
    fn return_at_module_level_is_an_error() {
        let mut vm = Vm::with(Box::new(SourceMap::new()), Box::new(SharedOutput::new()))
            .expect("core initialization");
        let diagnostics = compile(&mut vm, "main", "return 1;").unwrap_err();
        assert!(diagnostics[0].message.contains("Can't return from top-level code."));
    }

    #[test]
    fn jump_distances_stay_in_range() {
        // A chain of nested ifs stays well under the 16-bit jump limit but
        // exercises patching.
        let source = "if (true) { if (true) { if (true) { print 1; } } }";
        let (vm, module) = compile_module(source);
        walk_chunk(vm.heap(), module);
    }

    #[test]
    fn user_infix_registration_is_visible_while_compiling() {
        let (vm, module) = compile_module(
            "let infixr (3) $ = (f, x) => f(x); print (n => n + 1) $ 41;",
        );
        // The module must end up applying the infix via CallInfix.
        let ops = walk_chunk(vm.heap(), module);
        assert!(ops.contains(&Opcode::CallInfix));
    }
}
