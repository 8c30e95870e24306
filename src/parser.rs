// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Line-oriented Tarmac parser, as general as we can make it.
//!
//! Tarmac is only loosely a format: every simulator that emits it agrees on
//! the broad line shapes and disagrees on the details. The parser accepts
//! the union of the producer variants we have seen, normalises them into
//! typed events, and hands those to a [`ParseReceiver`] together with
//! highlight spans for front-ends that colour trace text.

use crate::registers::{lookup_reg_name, reg_size, RegisterId, RegPrefix};
use rustc_hash::FxHashSet;

/// Trace timestamp. Units vary by producer and are not interpreted.
pub type Time = u64;

/// Instruction-set state of an executed instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ISet {
    Arm,
    Thumb,
    A64,
}

/// Classification of a highlighted span of trace text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HighlightClass {
    None,
    Timestamp,
    Event,
    Pc,
    Instruction,
    ISet,
    CpuMode,
    CcFail,
    Disassembly,
    TextEvent,
    Punct,
    Error,
}

/// An instruction execution (or non-execution) event.
#[derive(Clone, Debug)]
pub struct InstructionEvent {
    pub time: Time,
    /// False for `IS` lines and `ES ... CCFAIL` lines.
    pub executed: bool,
    pub pc: u64,
    pub iset: ISet,
    /// Instruction width in bits (16 or 32).
    pub width: u32,
    pub instruction: u32,
    pub disassembly: String,
}

/// A register update.
#[derive(Clone, Debug)]
pub struct RegisterEvent {
    pub time: Time,
    pub reg: RegisterId,
    /// Byte offset of the update within the register (0 for full-width
    /// updates, which is all this parser produces).
    pub offset: usize,
    /// New contents, little-endian.
    pub bytes: Vec<u8>,
}

/// A memory access.
#[derive(Clone, Debug)]
pub struct MemoryEvent {
    pub time: Time,
    pub read: bool,
    /// False when the trace marked the transferred value as unknown.
    pub known: bool,
    pub size: usize,
    pub addr: u64,
    pub contents: u64,
}

/// Any line we display but ascribe no semantics to.
#[derive(Clone, Debug)]
pub struct TextOnlyEvent {
    pub time: Time,
    pub ty: String,
    pub msg: String,
}

/// A recoverable per-line parse failure.
///
/// The message embeds the offending line and a caret marker, ready for
/// display; `start..end` is the half-open character range of the bad token.
#[derive(Clone, Debug)]
pub struct ParseError {
    pub msg: String,
    pub start: usize,
    pub end: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for ParseError {}

type ParseResult<T> = Result<T, ParseError>;

/// Consumer of parse output.
///
/// The indexer, syntax highlighters and test receivers all implement this
/// independently; default methods ignore everything.
pub trait ParseReceiver {
    fn got_instruction(&mut self, _ev: InstructionEvent) {}
    fn got_register(&mut self, _ev: RegisterEvent) {}
    fn got_memory(&mut self, _ev: MemoryEvent) {}
    fn got_text(&mut self, _ev: TextOnlyEvent) {}

    /// `start..end` is a half-open character range into the parsed line.
    fn highlight(&mut self, _start: usize, _end: usize, _class: HighlightClass) {}

    /// Returns true to upgrade the warning into a parse error.
    fn parse_warning(&mut self, _msg: &str) -> bool {
        false
    }
}

/// Knobs that change how lines are interpreted.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParseParams {
    /// Guest memory is big-endian; affects how memory event values are
    /// assembled into bytes.
    pub bigend: bool,
    /// Assume Thumb when a producer omits the instruction-set state field.
    pub implicit_thumb: bool,
}

const DECIMAL: &str = "0123456789";
const HEX: &str = "0123456789ABCDEFabcdef";
const HEX_US: &str = "0123456789ABCDEFabcdef_";

#[derive(Clone, Debug, Eq, PartialEq)]
enum Tok {
    Eol,
    Punct(char),
    Word(String),
}

#[derive(Clone, Debug)]
struct Token {
    start: usize,
    end: usize,
    tok: Tok,
}

impl Token {
    fn is_eol(&self) -> bool {
        self.tok == Tok::Eol
    }

    fn is_word(&self) -> bool {
        matches!(self.tok, Tok::Word(_))
    }

    fn word(&self) -> &str {
        match &self.tok {
            Tok::Word(s) => s,
            _ => "",
        }
    }

    fn is_word_of(&self, permitted: &str) -> bool {
        match &self.tok {
            Tok::Word(s) => !s.is_empty() && s.chars().all(|c| permitted.contains(c)),
            _ => false,
        }
    }

    fn is_decimal(&self) -> bool {
        self.is_word_of(DECIMAL)
    }

    fn decimal_value(&self) -> u64 {
        self.word().parse().unwrap_or(u64::MAX)
    }

    fn is_hex(&self) -> bool {
        self.is_word_of(HEX)
    }

    fn is_hex_us(&self) -> bool {
        self.is_word_of(HEX_US)
    }

    /// A hex value optionally followed by an `_S` or `_NS` namespace
    /// qualifier, as some producers print for physical addresses.
    fn is_hex_with_optional_namespace(&self) -> bool {
        let Tok::Word(s) = &self.tok else { return false };
        for suffix in ["_S", "_NS", ""] {
            if let Some(body) = s.strip_suffix(suffix) {
                return !body.is_empty() && body.chars().all(|c| HEX.contains(c));
            }
        }
        false
    }

    fn hex_value(&self) -> u64 {
        u64::from_str_radix(self.word(), 16).unwrap_or(u64::MAX)
    }

    /// Character count of a word token (hex digit count drives widths).
    fn length(&self) -> usize {
        match &self.tok {
            Tok::Word(s) => s.len(),
            _ => 1,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.tok == Tok::Punct(c)
    }

    fn is(&self, s: &str) -> bool {
        self.word() == s
    }
}

fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' || c == b'#'
}

struct LineLexer<'a, 'r> {
    line: &'a str,
    pos: usize,
    size: usize,
    receiver: &'r mut dyn ParseReceiver,
}

impl<'a, 'r> LineLexer<'a, 'r> {
    fn new(line: &'a str, receiver: &'r mut dyn ParseReceiver) -> Self {
        let size = line.trim_end_matches(['\r', '\n']).len();
        Self {
            line,
            pos: 0,
            size,
            receiver,
        }
    }

    fn highlight(&mut self, start: usize, end: usize, class: HighlightClass) {
        self.receiver.highlight(start, end, class);
    }

    fn highlight_token(&mut self, tok: &Token, class: HighlightClass) {
        self.receiver.highlight(tok.start, tok.end, class);
    }

    fn lex_error(&mut self, pos: usize) -> ParseError {
        self.highlight(pos, self.size, HighlightClass::Error);
        let msg = format!(
            "Unrecognised token\n{}\n{}^\n",
            &self.line[..self.size],
            " ".repeat(pos)
        );
        ParseError {
            msg,
            start: pos,
            end: self.size,
        }
    }

    fn parse_error(&mut self, tok: &Token, msg: &str) -> ParseError {
        self.highlight_token(tok, HighlightClass::Error);
        let msg = format!(
            "{}\n{}\n{}{}\n",
            msg,
            &self.line[..self.size],
            " ".repeat(tok.start),
            "^".repeat((tok.end - tok.start).max(1))
        );
        ParseError {
            msg,
            start: tok.start,
            end: tok.end,
        }
    }

    fn lex(&mut self) -> ParseResult<Token> {
        let bytes = self.line.as_bytes();

        while self.pos < self.size && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }

        if self.pos == self.size {
            return Ok(Token {
                start: self.pos,
                end: self.pos,
                tok: Tok::Eol,
            });
        }

        // Punctuation characters returned as single tokens.
        if b":()[],".contains(&bytes[self.pos]) {
            let tok = Token {
                start: self.pos,
                end: self.pos + 1,
                tok: Tok::Punct(bytes[self.pos] as char),
            };
            self.highlight_token(&tok, HighlightClass::Punct);
            self.pos += 1;
            return Ok(tok);
        }

        // Otherwise a word of alphanumerics, underscores, minus signs,
        // dots and hashes.
        let start = self.pos;
        while self.pos < self.size && is_word_char(bytes[self.pos]) {
            self.pos += 1;
        }
        if self.pos > start {
            return Ok(Token {
                start,
                end: self.pos,
                tok: Tok::Word(self.line[start..self.pos].to_string()),
            });
        }

        Err(self.lex_error(self.pos))
    }

    fn rest_from(&self, pos: usize) -> &'a str {
        &self.line[pos.min(self.size)..self.size]
    }
}

fn parse_iset_state(tok: &Token) -> Option<ISet> {
    match tok.word() {
        "A" => Some(ISet::Arm),
        "T" => Some(ISet::Thumb),
        "O" => Some(ISet::A64),
        _ => None,
    }
}

const CONTIGUOUS_MEM_EVENTS: &[&str] = &[
    "MR1", "MR2", "MR4", "MR8", "MW1", "MW2", "MW4", "MW8", //
    "MR1X", "MR2X", "MR4X", "MR8X", "MW1X", "MW2X", "MW4X", "MW8X", //
    "R01", "R02", "R04", "R08", "W01", "W02", "W04", "W08",
];

/// Tarmac event types we know carry no state we model, so they pass
/// through as text without a warning.
const BENIGN_TEXT_EVENTS: &[&str] = &[
    "CADI", "E", "P", "CACHE", "TTW", "BR", "INFO_EXCEPTION_REASON", "SIGNAL", "EXC",
];

/// Streaming Tarmac line parser.
///
/// Holds cross-line state: the timestamp inherited by untimestamped lines
/// and the names already warned about.
pub struct TarmacLineParser {
    params: ParseParams,
    last_timestamp: Time,
    unrecognised_registers: FxHashSet<String>,
    unrecognised_system_ops: FxHashSet<String>,
    unrecognised_events: FxHashSet<String>,
}

impl TarmacLineParser {
    #[must_use]
    pub fn new(params: ParseParams) -> Self {
        Self {
            params,
            // Untimestamped lines before the first timestamped one get
            // time 0, the only value guaranteed not to break monotonicity.
            last_timestamp: 0,
            unrecognised_registers: FxHashSet::default(),
            unrecognised_system_ops: FxHashSet::default(),
            unrecognised_events: FxHashSet::default(),
        }
    }

    /// Parses one line, delivering events and highlights to `receiver`.
    pub fn parse(&mut self, line: &str, receiver: &mut dyn ParseReceiver) -> ParseResult<()> {
        let mut lx = LineLexer::new(line, receiver);
        let mut tok = lx.lex()?;

        // Tarmac lines often, but not always, start with a timestamp.
        let time;
        if tok.is_decimal() {
            time = tok.decimal_value();
            lx.highlight_token(&tok, HighlightClass::Timestamp);
            tok = lx.lex()?;

            if ["clk", "ns", "cs", "cyc", "tic"].contains(&tok.word()) {
                tok = lx.lex()?;
            }

            self.last_timestamp = time;
        } else {
            // No timestamp: simultaneous with the previous line.
            time = self.last_timestamp;
        }

        // A trace source identifier may follow; we only handle single-core
        // traces, so cpuN prefixes are dropped.
        if tok.word().starts_with("cpu") {
            tok = lx.lex()?;
        }

        lx.highlight_token(&tok, HighlightClass::Event);

        if tok.is("IT") || tok.is("IS") || tok.is("ES") {
            self.parse_instruction(&mut lx, tok, time)
        } else if tok.is("R") {
            self.parse_register(&mut lx, time)
        } else if tok.is_word() && CONTIGUOUS_MEM_EVENTS.contains(&tok.word()) {
            self.parse_contiguous_memory(&mut lx, tok, time)
        } else if tok.is("LD") || tok.is("ST") {
            self.parse_diagram_memory(&mut lx, tok, time)
        } else if tok.is("Tarmac") {
            // Container-format header line ("Tarmac Text Rev 1" etc).
            // Dropped completely: it precedes the first timestamp and is
            // not an event.
            Ok(())
        } else {
            self.parse_text_only(&mut lx, tok, time)
        }
    }

    fn warning(&self, lx: &mut LineLexer<'_, '_>, msg: &str) -> ParseResult<()> {
        if lx.receiver.parse_warning(msg) {
            Err(ParseError {
                msg: msg.to_string(),
                start: 0,
                end: 0,
            })
        } else {
            Ok(())
        }
    }

    #[allow(clippy::too_many_lines)]
    fn parse_instruction(
        &mut self,
        lx: &mut LineLexer<'_, '_>,
        event_tok: Token,
        time: Time,
    ) -> ParseResult<()> {
        // "IS" is Fast-Models-speak for 'instruction failed its
        // condition'. An "ES" line signals the same thing with a CCFAIL
        // token before the disassembly, handled further down.
        let mut executed = !event_tok.is("IS");
        let is_es = event_tok.is("ES");

        let mut tok = lx.lex()?;
        if tok.is("EXC") || tok.is("Reset") {
            // An exception event relating to the instruction, e.g. because
            // it was illegal. Abandon the instruction parse; it's text.
            let tok = lx.lex()?;
            lx.highlight(tok.start, lx.size, HighlightClass::TextEvent);
            let msg = lx.rest_from(tok.start).to_string();
            lx.receiver.got_text(TextOnlyEvent {
                time,
                ty: "EXC".to_string(),
                msg,
            });
            return Ok(());
        }

        let mut address;
        let bitpattern;
        let width;

        if is_es {
            // After "ES": address and bit pattern, parenthesised and
            // colon-separated.
            if !tok.is_punct('(') {
                return Err(lx.parse_error(
                    &tok,
                    "expected '(' to introduce instruction address and bit pattern",
                ));
            }
            tok = lx.lex()?;

            if !tok.is_hex() {
                return Err(lx.parse_error(&tok, "expected a hex instruction address"));
            }
            address = tok.hex_value();
            lx.highlight_token(&tok, HighlightClass::Pc);
            tok = lx.lex()?;

            if !tok.is_punct(':') {
                return Err(lx.parse_error(
                    &tok,
                    "expected ':' between instruction address and bit pattern",
                ));
            }
            tok = lx.lex()?;

            if !tok.is_hex() {
                return Err(lx.parse_error(&tok, "expected a hex instruction bit pattern"));
            }
            bitpattern = tok.hex_value() as u32;
            lx.highlight_token(&tok, HighlightClass::Instruction);
            width = tok.length() as u32 * 4;
            tok = lx.lex()?;

            if !tok.is_punct(')') {
                return Err(lx.parse_error(
                    &tok,
                    "expected ')' after instruction address and bit pattern",
                ));
            }
            tok = lx.lex()?;
        } else {
            // After "IT" or "IS", a Fast Models-style line:
            //
            //   IT (xxxx) yyyy zzzz S M : disassembly
            //
            // In FM the bracketed xxxx is a decimal instruction counter,
            // yyyy the address and zzzz the encoding. At least one other
            // producer puts the address in the brackets (in hex!) and
            // omits yyyy, so we cannot tell which variant we have until
            // the instruction-set state token shows up.
            let mut bracketed = None;
            if tok.is_punct('(') {
                tok = lx.lex()?;
                if !tok.is_decimal() && !tok.is_hex() {
                    return Err(lx.parse_error(&tok, "expected a hex or decimal number"));
                }
                bracketed = Some(tok.clone());

                tok = lx.lex()?;
                if !tok.is_punct(')') {
                    return Err(lx.parse_error(&tok, "expected ')' after bracketed value"));
                }
                tok = lx.lex()?;
            }

            if !tok.is_hex() {
                return Err(lx.parse_error(&tok, "expected a hex value"));
            }
            let postbracket = tok.clone();
            address = tok.hex_value();
            lx.highlight_token(&tok, HighlightClass::Pc);
            tok = lx.lex()?;

            if tok.is_punct(':') {
                // Optionally a colon and another hex address: a physical
                // address alongside the virtual one. We track virtual
                // addresses, so it is skipped.
                tok = lx.lex()?;
                if !tok.is_hex_with_optional_namespace() {
                    return Err(lx.parse_error(&tok, "expected a hex address after ':'"));
                }
                tok = lx.lex()?;
                if tok.is_punct(',') {
                    // And optionally yet another, seen for 4-byte Thumb
                    // instructions where the two halfword addresses are
                    // printed separately.
                    tok = lx.lex()?;
                    if !tok.is_hex_with_optional_namespace() {
                        return Err(lx.parse_error(&tok, "expected a hex address after ','"));
                    }
                    tok = lx.lex()?;
                }
            }

            let instruction;
            if parse_iset_state(&tok).is_some() {
                // An instruction-set state already: the bracketed value
                // was the address and what we read as the address was the
                // bit pattern.
                let bracketed = bracketed
                    .ok_or_else(|| lx.parse_error(&tok, "expected an instruction address"))?;
                instruction = postbracket;
                address = bracketed.hex_value();
                lx.highlight_token(&bracketed, HighlightClass::Pc);
            } else {
                if !tok.is_hex() {
                    return Err(lx.parse_error(&tok, "expected a hex instruction bit pattern"));
                }
                instruction = tok.clone();
                tok = lx.lex()?;
            }
            bitpattern = instruction.hex_value() as u32;
            lx.highlight_token(&instruction, HighlightClass::Instruction);
            width = instruction.length() as u32 * 4;
        }

        // ES and IT/IS reconverge here.
        let iset = match parse_iset_state(&tok) {
            Some(iset) => {
                lx.highlight_token(&tok, HighlightClass::ISet);
                tok = lx.lex()?;
                iset
            }
            None if self.params.implicit_thumb => ISet::Thumb,
            None => {
                return Err(lx.parse_error(&tok, "expected instruction-set state"));
            }
        };

        if !tok.is_word() {
            return Err(lx.parse_error(&tok, "expected CPU mode"));
        }
        // The CPU mode is ignored; tracking register bank switching would
        // need it.
        lx.highlight_token(&tok, HighlightClass::CpuMode);
        tok = lx.lex()?;

        if !tok.is_punct(':') {
            return Err(lx.parse_error(&tok, "expected ':' before instruction"));
        }
        tok = lx.lex()?;

        if is_es && tok.is("CCFAIL") {
            executed = false;
            lx.highlight_token(&tok, HighlightClass::CcFail);
            tok = lx.lex()?;
        }

        lx.highlight(tok.start, lx.size, HighlightClass::Disassembly);
        let disassembly = lx.rest_from(tok.start).to_string();
        lx.receiver.got_instruction(InstructionEvent {
            time,
            executed,
            pc: address,
            iset,
            width,
            instruction: bitpattern,
            disassembly,
        });
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn parse_register(&mut self, lx: &mut LineLexer<'_, '_>, time: Time) -> ParseResult<()> {
        let mut tok = lx.lex()?;
        if !tok.is_word() {
            return Err(lx.parse_error(&tok, "expected register name"));
        }
        let regname = tok.word().to_string();
        tok = lx.lex()?;

        if ["DC", "IC", "TLBI", "AT"].contains(&regname.as_str()) {
            if self.unrecognised_system_ops.insert(regname.clone()) {
                self.warning(lx, &format!("unsupported system operation '{regname}'"))?;
            }
            return Ok(());
        }

        // Some producers follow the register name with a parenthesised
        // qualifier, e.g. "SCTLR (AARCH32)" or "R1 (USR)".
        if tok.is_punct('(') {
            tok = lx.lex()?;
            if !tok.is_word() {
                return Err(lx.parse_error(
                    &tok,
                    "expected extra register identification details",
                ));
            }
            tok = lx.lex()?;
            if !tok.is_punct(')') {
                return Err(lx.parse_error(
                    &tok,
                    "expected ')' after extra register identification details",
                ));
            }
            tok = lx.lex()?;
        }

        // lookup_reg_name usually tells us how wide the register is, with
        // two exceptions. 'sp' may be the AArch32 or AArch64 stack
        // pointer, which have different ids; the data width decides. And
        // 'fpcr' sometimes appears with 64 bits of data although it is
        // 32-bit, in which case we keep the least-significant half.
        let mut reg = lookup_reg_name(&regname);
        let is_fpcr = reg.is_some_and(|r| r.prefix == RegPrefix::Fpcr);
        let lower = regname.to_ascii_lowercase();
        let is_sp = lower == "sp" || lower.starts_with("sp_");
        let special = is_fpcr || is_sp;

        let mut contents = String::new();
        let consume = |contents: &mut String, tok: &Token| {
            contents.extend(tok.word().chars().filter(|&c| c != '_'));
        };

        if let (Some(r), false) = (reg, special) {
            // Consume register contents until we have as much data as the
            // register holds; it may arrive split across several tokens by
            // spaces or colons, or contain underscores.
            let hex_digits_expected = 2 * reg_size(&r);
            while contents.len() < hex_digits_expected {
                if !tok.is_hex_us() {
                    return Err(lx.parse_error(&tok, "expected register contents"));
                }
                consume(&mut contents, &tok);
                tok = lx.lex()?;

                if tok.is_punct(':') {
                    tok = lx.lex()?;
                }
            }
        } else if special {
            // For SP and FPCR we have to wait and see how much data the
            // line provides: one contiguous token, plus a second if a ':'
            // follows.
            if !tok.is_hex_us() {
                return Err(lx.parse_error(&tok, "expected register contents"));
            }
            consume(&mut contents, &tok);
            tok = lx.lex()?;

            if tok.is_punct(':') {
                tok = lx.lex()?;
                if !tok.is_hex_us() {
                    return Err(lx.parse_error(
                        &tok,
                        "expected additional register contents after ':'",
                    ));
                }
                consume(&mut contents, &tok);
            }

            if is_sp {
                if contents.len() == 8 {
                    reg = Some(crate::registers::REG_32_SP);
                } else if contents.len() == 16 {
                    reg = Some(crate::registers::REG_64_XSP);
                }
            }
        } else {
            // Unknown register: gather one token of contents so the width
            // is known for diagnostics, then fall through to the
            // once-per-name warning.
            if tok.is_hex_us() {
                consume(&mut contents, &tok);
            }
        }

        let bits = contents.len() * 4;
        if bits % 8 != 0 {
            return Err(lx.parse_error(
                &tok,
                "expected register contents to be an integer number of bytes",
            ));
        }

        let Some(reg) = reg else {
            if self.unrecognised_registers.insert(regname.clone()) {
                self.warning(
                    lx,
                    &format!("unrecognised {bits}-bit register '{regname}'"),
                )?;
            }
            return Ok(());
        };

        let mut bytes: Vec<u8> = (0..contents.len())
            .step_by(2)
            .map(|pos| u8::from_str_radix(&contents[pos..pos + 2], 16).unwrap_or(0))
            .collect();

        // The trace prints register values in reading order, i.e.
        // big-endian; our register space stores them little-endian.
        bytes.reverse();

        // A 64-bit FPCR update keeps only the LSW, which after the
        // reversal is the front of the vector.
        if is_fpcr {
            bytes.truncate(reg_size(&reg));
        }

        lx.receiver.got_register(RegisterEvent {
            time,
            reg,
            offset: 0,
            bytes,
        });
        Ok(())
    }

    fn parse_contiguous_memory(
        &mut self,
        lx: &mut LineLexer<'_, '_>,
        event_tok: Token,
        time: Time,
    ) -> ParseResult<()> {
        let word = event_tok.word();
        let body = word.strip_prefix('M').unwrap_or(word);
        let read = body.starts_with('R');
        // Covers both the "MR4"/"MR4X" and the "R04" spellings.
        let size: usize = body[1..].trim_end_matches('X').parse().unwrap_or(0);

        let mut tok = lx.lex()?;
        if tok.is("X") {
            // An exclusive access flagged as a separate token (it may also
            // be folded into the event type, e.g. "MR4X"). Exclusive
            // operations are not distinguished, so it is skipped.
            tok = lx.lex()?;
        }

        if !tok.is_hex() {
            return Err(lx.parse_error(&tok, "expected memory address"));
        }
        let addr = tok.hex_value();
        tok = lx.lex()?;

        if tok.is_punct(':') {
            // virtual:physical address pair; we track virtual addresses.
            tok = lx.lex()?;
            if !tok.is_hex() {
                return Err(lx.parse_error(&tok, "expected physical memory address after ':'"));
            }
            tok = lx.lex()?;
        }

        if tok.is_punct('(') {
            // A parenthesised keyword such as "(ABORTED)": not a memory
            // access at all.
            tok = lx.lex()?;
            if tok.is("ABORTED") {
                let close = lx.lex()?;
                if !close.is_punct(')') {
                    return Err(lx.parse_error(&close, "expected closing parenthesis"));
                }
                lx.highlight(tok.start, lx.size, HighlightClass::TextEvent);
                let msg = lx.rest_from(event_tok.start).to_string();
                lx.receiver.got_text(TextOnlyEvent {
                    time,
                    ty: tok.word().to_string(),
                    msg,
                });
                return Ok(());
            }
            return Err(lx.parse_error(&tok, "unrecognised parenthesised keyword"));
        }

        // Values longer than 8 bytes are broken up by underscores; strip
        // them and read one integer.
        if let Tok::Word(s) = &mut tok.tok {
            s.retain(|c| c != '_');
        }
        if !tok.is_hex() {
            return Err(lx.parse_error(&tok, "expected memory contents in hex"));
        }
        let contents = tok.hex_value();

        lx.receiver.got_memory(MemoryEvent {
            time,
            read,
            known: true,
            size,
            addr,
            contents,
        });
        Ok(())
    }

    fn parse_diagram_memory(
        &mut self,
        lx: &mut LineLexer<'_, '_>,
        event_tok: Token,
        time: Time,
    ) -> ParseResult<()> {
        let read = event_tok.is("LD");
        let mut tok = lx.lex()?;

        if !tok.is_hex() {
            return Err(lx.parse_error(&tok, "expected load/store memory address"));
        }
        let baseaddr = tok.hex_value();
        tok = lx.lex()?;

        // A diagram of 16 bytes of memory starting at the base address,
        // highest address leftmost: hex digit pairs for known bytes, ".."
        // for bytes not accessed, "##" for accessed-but-unknown bytes.
        #[derive(Clone, Copy, PartialEq)]
        enum ByteState {
            Unused,
            Unknown,
            Known(u8),
        }
        let mut bytes = [ByteState::Unused; 16];
        let mut bytepos = 0usize;

        loop {
            if !tok.is_word_of("0123456789ABCDEFabcdef.#") {
                return Err(lx.parse_error(&tok, "expected a word of data bytes, '.' and '#'"));
            }
            let s = tok.word().to_string();
            if s.len() % 2 != 0 {
                return Err(lx.parse_error(
                    &tok,
                    "expected data word to cover a whole number of bytes",
                ));
            }
            for i in (0..s.len()).step_by(2) {
                let byte = &s[i..i + 2];
                let bytetok = Token {
                    start: tok.start + i,
                    end: tok.start + i + 2,
                    tok: Tok::Word(byte.to_string()),
                };

                if bytepos >= 16 {
                    return Err(lx.parse_error(&bytetok, "expected exactly 16 data bytes"));
                }

                bytes[bytepos] = if byte == ".." {
                    ByteState::Unused
                } else if byte == "##" {
                    ByteState::Unknown
                } else if bytetok.is_hex() {
                    ByteState::Known(bytetok.hex_value() as u8)
                } else {
                    return Err(lx.parse_error(
                        &bytetok,
                        "expected each byte to be only one of '.', '#' and hex",
                    ));
                };
                bytepos += 1;
            }
            if bytepos == 16 {
                break;
            }
            tok = lx.lex()?;
        }

        // Combine adjacent non-unused bytes into memory access events.
        let mut i = 0usize;
        while i < 16 {
            match bytes[i] {
                ByteState::Unused => i += 1,
                ByteState::Unknown => {
                    let mut j = i;
                    while j < 16 && bytes[j] == ByteState::Unknown {
                        j += 1;
                    }
                    lx.receiver.got_memory(MemoryEvent {
                        time,
                        read,
                        known: false,
                        size: j - i,
                        addr: baseaddr + (16 - j) as u64,
                        contents: 0,
                    });
                    i = j;
                }
                ByteState::Known(_) => {
                    let mut j = i;
                    while j < 16 && j - i < 8 && matches!(bytes[j], ByteState::Known(_)) {
                        j += 1;
                    }

                    // The diagram is always little-endian, whatever the
                    // system endianness; MemoryEvent contents are in
                    // system endianness, so convert here.
                    let run: Vec<u8> = bytes[i..j]
                        .iter()
                        .map(|b| match b {
                            ByteState::Known(v) => *v,
                            _ => 0,
                        })
                        .collect();
                    let mut value = 0u64;
                    if self.params.bigend {
                        for &b in run.iter().rev() {
                            value = (value << 8) | u64::from(b);
                        }
                    } else {
                        for &b in &run {
                            value = (value << 8) | u64::from(b);
                        }
                    }

                    lx.receiver.got_memory(MemoryEvent {
                        time,
                        read,
                        known: true,
                        size: j - i,
                        addr: baseaddr + (16 - j) as u64,
                        contents: value,
                    });
                    i = j;
                }
            }
        }
        Ok(())
    }

    fn parse_text_only(
        &mut self,
        lx: &mut LineLexer<'_, '_>,
        event_tok: Token,
        time: Time,
    ) -> ParseResult<()> {
        // Anything else still shows up in the trace but has no semantic
        // effect on our model of the world. Types outside the known-benign
        // set provoke a warning in case they did have semantics we
        // shouldn't have ignored.
        let ty = event_tok.word().to_string();
        if !BENIGN_TEXT_EVENTS.contains(&ty.as_str()) && self.unrecognised_events.insert(ty.clone())
        {
            self.warning(lx, &format!("unknown Tarmac event type '{ty}'"))?;
        }

        let tok = lx.lex()?;
        lx.highlight(tok.start, lx.size, HighlightClass::TextEvent);
        let msg = lx.rest_from(tok.start).to_string();
        lx.receiver.got_text(TextOnlyEvent { time, ty, msg });
        Ok(())
    }
}
