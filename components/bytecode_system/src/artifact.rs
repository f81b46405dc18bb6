//! Binary artifact serialization.
//!
//! The artifact is the compiler collaborator's output and the VM's input:
//! a header with magic and version, a section table, and one body per
//! section (constant pool, code segment, function table, agent table).
//!
//! Unknown section kinds are tolerated for forward compatibility, but
//! every declared section's bounds are checked strictly: a known section
//! must decode to exactly its declared length.

use crate::opcode::Opcode;
use crate::program::{AgentDef, Const, FunctionDef, Program};
use thiserror::Error;

/// Magic number at the start of every artifact.
pub const MAGIC: &[u8; 4] = b"VEGA";
/// Current artifact format version.
pub const VERSION: u16 = 1;

const SECTION_CONSTANTS: u16 = 1;
const SECTION_CODE: u16 = 2;
const SECTION_FUNCTIONS: u16 = 3;
const SECTION_AGENTS: u16 = 4;

/// A malformed-artifact error. Fatal at startup; aborts the whole run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    /// The file does not start with the Vega magic number
    #[error("bad magic number")]
    BadMagic,
    /// The artifact was produced by an unsupported format version
    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u16),
    /// A declared section extends past the end of the file
    #[error("truncated {0} section")]
    Truncated(&'static str),
    /// A section body did not decode to exactly its declared length
    #[error("{section} section size mismatch: declared {declared} bytes, decoded {decoded}")]
    SizeMismatch {
        /// Section name
        section: &'static str,
        /// Length declared in the section table
        declared: usize,
        /// Bytes actually consumed by decoding
        decoded: usize,
    },
    /// A section body contained invalid data
    #[error("malformed {section} section: {detail}")]
    Malformed {
        /// Section name
        section: &'static str,
        /// What was wrong
        detail: String,
    },
}

/// Serializes a program into artifact bytes.
///
/// # Examples
///
/// ```
/// use bytecode_system::{artifact, Const, Opcode, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// let c = b.add_constant(Const::Int(7));
/// b.begin_function("main", 0, 0);
/// b.emit(Opcode::PushConst(c));
/// b.emit(Opcode::Return);
/// b.finish_function();
/// let program = b.finish();
///
/// let bytes = artifact::to_bytes(&program);
/// let restored = artifact::load(&bytes).unwrap();
/// assert_eq!(restored, program);
/// ```
pub fn to_bytes(program: &Program) -> Vec<u8> {
    let sections = [
        (SECTION_CONSTANTS, encode_constants(&program.constants)),
        (SECTION_CODE, encode_code(&program.code)),
        (SECTION_FUNCTIONS, encode_functions(&program.functions)),
        (SECTION_AGENTS, encode_agents(&program.agents)),
    ];

    let mut bytes = Vec::new();
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(sections.len() as u16).to_le_bytes());

    // Section table, bodies follow it directly
    let mut offset = 8 + sections.len() * 10;
    for (kind, body) in &sections {
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&(offset as u32).to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        offset += body.len();
    }
    for (_, body) in &sections {
        bytes.extend_from_slice(body);
    }
    bytes
}

/// Parses artifact bytes into a program.
///
/// Rejects bad magic, unsupported versions, truncated or size-mismatched
/// declared sections, and function entries whose code range falls outside
/// the code segment. Unknown section kinds are skipped.
pub fn load(bytes: &[u8]) -> Result<Program, LoadError> {
    if bytes.len() < 8 {
        return Err(LoadError::Truncated("header"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }
    let section_count = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    let table_end = 8 + section_count * 10;
    if bytes.len() < table_end {
        return Err(LoadError::Truncated("section table"));
    }

    let mut program = Program::default();
    for i in 0..section_count {
        let entry = &bytes[8 + i * 10..8 + (i + 1) * 10];
        let kind = u16::from_le_bytes([entry[0], entry[1]]);
        let offset = u32::from_le_bytes([entry[2], entry[3], entry[4], entry[5]]) as usize;
        let len = u32::from_le_bytes([entry[6], entry[7], entry[8], entry[9]]) as usize;

        let name = section_name(kind);
        let body = bytes
            .get(offset..offset.saturating_add(len))
            .ok_or(LoadError::Truncated(name))?;

        match kind {
            SECTION_CONSTANTS => program.constants = decode_constants(body)?,
            SECTION_CODE => program.code = decode_code(body)?,
            SECTION_FUNCTIONS => program.functions = decode_functions(body)?,
            SECTION_AGENTS => program.agents = decode_agents(body)?,
            // Unknown kinds are tolerated; bounds were still checked above
            _ => {}
        }
    }

    for f in &program.functions {
        if f.code_offset + f.code_len > program.code.len() {
            return Err(LoadError::Malformed {
                section: "function table",
                detail: format!(
                    "function '{}' addresses code {}..{} outside segment of {}",
                    f.name,
                    f.code_offset,
                    f.code_offset + f.code_len,
                    program.code.len()
                ),
            });
        }
    }
    Ok(program)
}

fn section_name(kind: u16) -> &'static str {
    match kind {
        SECTION_CONSTANTS => "constant pool",
        SECTION_CODE => "code",
        SECTION_FUNCTIONS => "function table",
        SECTION_AGENTS => "agent table",
        _ => "unknown",
    }
}

// ---- encoding ----

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_constants(constants: &[Const]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(constants.len() as u32).to_le_bytes());
    for c in constants {
        match c {
            Const::Null => out.push(0),
            Const::Bool(b) => {
                out.push(1);
                out.push(u8::from(*b));
            }
            Const::Int(n) => {
                out.push(2);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Const::Float(n) => {
                out.push(3);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Const::Str(s) => {
                out.push(4);
                put_str(&mut out, s);
            }
        }
    }
    out
}

fn encode_code(code: &[Opcode]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
    for op in code {
        match op {
            Opcode::PushConst(i) => {
                out.push(0);
                out.extend_from_slice(&(*i as u32).to_le_bytes());
            }
            Opcode::PushNull => out.push(1),
            Opcode::PushTrue => out.push(2),
            Opcode::PushFalse => out.push(3),
            Opcode::PushFunction(i) => {
                out.push(4);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::Pop => out.push(5),
            Opcode::Dup => out.push(6),
            Opcode::LoadLocal(i) => {
                out.push(7);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::StoreLocal(i) => {
                out.push(8);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::LoadGlobal(i) => {
                out.push(9);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::StoreGlobal(i) => {
                out.push(10);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::Add => out.push(11),
            Opcode::Sub => out.push(12),
            Opcode::Mul => out.push(13),
            Opcode::Div => out.push(14),
            Opcode::Mod => out.push(15),
            Opcode::Neg => out.push(16),
            Opcode::Not => out.push(17),
            Opcode::And => out.push(18),
            Opcode::Or => out.push(19),
            Opcode::Equal => out.push(20),
            Opcode::NotEqual => out.push(21),
            Opcode::Less => out.push(22),
            Opcode::LessEqual => out.push(23),
            Opcode::Greater => out.push(24),
            Opcode::GreaterEqual => out.push(25),
            Opcode::Jump(t) => {
                out.push(26);
                out.extend_from_slice(&(*t as u32).to_le_bytes());
            }
            Opcode::JumpIfTrue(t) => {
                out.push(27);
                out.extend_from_slice(&(*t as u32).to_le_bytes());
            }
            Opcode::JumpIfFalse(t) => {
                out.push(28);
                out.extend_from_slice(&(*t as u32).to_le_bytes());
            }
            Opcode::Call(argc) => {
                out.push(29);
                out.push(*argc);
            }
            Opcode::Return => out.push(30),
            Opcode::CallNative(id, argc) => {
                out.push(31);
                out.extend_from_slice(&id.to_le_bytes());
                out.push(*argc);
            }
            Opcode::SpawnAgent(i) => {
                out.push(32);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Opcode::AgentSend => out.push(33),
            Opcode::MakeArray(n) => {
                out.push(34);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Opcode::MakeObject(n) => {
                out.push(35);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Opcode::GetIndex => out.push(36),
            Opcode::SetIndex => out.push(37),
            Opcode::GetField(i) => {
                out.push(38);
                out.extend_from_slice(&(*i as u32).to_le_bytes());
            }
            Opcode::SetField(i) => {
                out.push(39);
                out.extend_from_slice(&(*i as u32).to_le_bytes());
            }
            Opcode::Print => out.push(40),
        }
    }
    out
}

fn encode_functions(functions: &[FunctionDef]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(functions.len() as u32).to_le_bytes());
    for f in functions {
        put_str(&mut out, &f.name);
        out.push(f.arity);
        out.extend_from_slice(&f.locals.to_le_bytes());
        out.extend_from_slice(&(f.code_offset as u32).to_le_bytes());
        out.extend_from_slice(&(f.code_len as u32).to_le_bytes());
    }
    out
}

fn encode_agents(agents: &[AgentDef]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(agents.len() as u32).to_le_bytes());
    for a in agents {
        put_str(&mut out, &a.name);
        put_str(&mut out, &a.model);
        put_str(&mut out, &a.system_prompt);
        out.extend_from_slice(&a.temperature.to_le_bytes());
        out.extend_from_slice(&(a.tools.len() as u16).to_le_bytes());
        for t in &a.tools {
            out.extend_from_slice(&t.to_le_bytes());
        }
    }
    out
}

// ---- decoding ----

/// Byte cursor over one section body. Every read is bounds-checked and
/// reports the owning section on truncation.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    section: &'static str,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], section: &'static str) -> Self {
        Self {
            bytes,
            pos: 0,
            section,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos.saturating_add(n))
            .ok_or(LoadError::Truncated(self.section))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }

    fn str(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Malformed {
            section: self.section,
            detail: "string is not valid UTF-8".to_string(),
        })
    }

    /// Declared-length check: decoding must have consumed every byte.
    fn finish(self) -> Result<(), LoadError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(LoadError::SizeMismatch {
                section: self.section,
                declared: self.bytes.len(),
                decoded: self.pos,
            })
        }
    }
}

fn decode_constants(body: &[u8]) -> Result<Vec<Const>, LoadError> {
    let mut r = Reader::new(body, "constant pool");
    let count = r.u32()? as usize;
    let mut constants = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = r.u8()?;
        constants.push(match tag {
            0 => Const::Null,
            1 => Const::Bool(r.u8()? != 0),
            2 => Const::Int(r.i64()?),
            3 => Const::Float(r.f64()?),
            4 => Const::Str(r.str()?),
            other => {
                return Err(LoadError::Malformed {
                    section: "constant pool",
                    detail: format!("unknown constant tag {other}"),
                })
            }
        });
    }
    r.finish()?;
    Ok(constants)
}

fn decode_code(body: &[u8]) -> Result<Vec<Opcode>, LoadError> {
    let mut r = Reader::new(body, "code");
    let count = r.u32()? as usize;
    let mut code = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = r.u8()?;
        code.push(match tag {
            0 => Opcode::PushConst(r.u32()? as usize),
            1 => Opcode::PushNull,
            2 => Opcode::PushTrue,
            3 => Opcode::PushFalse,
            4 => Opcode::PushFunction(r.u16()?),
            5 => Opcode::Pop,
            6 => Opcode::Dup,
            7 => Opcode::LoadLocal(r.u16()?),
            8 => Opcode::StoreLocal(r.u16()?),
            9 => Opcode::LoadGlobal(r.u16()?),
            10 => Opcode::StoreGlobal(r.u16()?),
            11 => Opcode::Add,
            12 => Opcode::Sub,
            13 => Opcode::Mul,
            14 => Opcode::Div,
            15 => Opcode::Mod,
            16 => Opcode::Neg,
            17 => Opcode::Not,
            18 => Opcode::And,
            19 => Opcode::Or,
            20 => Opcode::Equal,
            21 => Opcode::NotEqual,
            22 => Opcode::Less,
            23 => Opcode::LessEqual,
            24 => Opcode::Greater,
            25 => Opcode::GreaterEqual,
            26 => Opcode::Jump(r.u32()? as usize),
            27 => Opcode::JumpIfTrue(r.u32()? as usize),
            28 => Opcode::JumpIfFalse(r.u32()? as usize),
            29 => Opcode::Call(r.u8()?),
            30 => Opcode::Return,
            31 => Opcode::CallNative(r.u16()?, r.u8()?),
            32 => Opcode::SpawnAgent(r.u16()?),
            33 => Opcode::AgentSend,
            34 => Opcode::MakeArray(r.u16()?),
            35 => Opcode::MakeObject(r.u16()?),
            36 => Opcode::GetIndex,
            37 => Opcode::SetIndex,
            38 => Opcode::GetField(r.u32()? as usize),
            39 => Opcode::SetField(r.u32()? as usize),
            40 => Opcode::Print,
            other => {
                return Err(LoadError::Malformed {
                    section: "code",
                    detail: format!("unknown opcode tag {other}"),
                })
            }
        });
    }
    r.finish()?;
    Ok(code)
}

fn decode_functions(body: &[u8]) -> Result<Vec<FunctionDef>, LoadError> {
    let mut r = Reader::new(body, "function table");
    let count = r.u32()? as usize;
    let mut functions = Vec::with_capacity(count);
    for _ in 0..count {
        functions.push(FunctionDef {
            name: r.str()?,
            arity: r.u8()?,
            locals: r.u16()?,
            code_offset: r.u32()? as usize,
            code_len: r.u32()? as usize,
        });
    }
    r.finish()?;
    Ok(functions)
}

fn decode_agents(body: &[u8]) -> Result<Vec<AgentDef>, LoadError> {
    let mut r = Reader::new(body, "agent table");
    let count = r.u32()? as usize;
    let mut agents = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.str()?;
        let model = r.str()?;
        let system_prompt = r.str()?;
        let temperature = r.f64()?;
        let tool_count = r.u16()? as usize;
        let mut tools = Vec::with_capacity(tool_count);
        for _ in 0..tool_count {
            tools.push(r.u16()?);
        }
        agents.push(AgentDef {
            name,
            model,
            system_prompt,
            temperature,
            tools,
        });
    }
    r.finish()?;
    Ok(agents)
}
