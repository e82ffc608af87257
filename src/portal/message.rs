use serde::Serialize;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

/// Argument value carried by a portal method call, reply or signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Value {
    Bool(bool),
    U32(u32),
    I32(i32),
    Str(String),
    /// `ay`
    Bytes(Vec<u8>),
    /// `aay`
    ByteArrays(Vec<Vec<u8>>),
    /// `a{uh}`: target fd number in the child -> fd in this process
    FdMap(BTreeMap<u32, RawFd>),
    /// `a{ss}`
    StrMap(BTreeMap<String, String>),
    /// `a{sv}`
    Variants(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MethodCall {
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(interface: &str, member: &str) -> Self {
        Self {
            interface: interface.to_string(),
            member: member.to_string(),
            args: Vec::new(),
        }
    }

    pub fn append(&mut self, value: Value) -> &mut Self {
        self.args.push(value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignalMessage {
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

impl SignalMessage {
    pub fn new(interface: &str, member: &str, args: Vec<Value>) -> Self {
        Self {
            interface: interface.to_string(),
            member: member.to_string(),
            args,
        }
    }

    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(&self.args)
    }
}

/// Sequential reader over message arguments.
pub struct MessageReader<'a> {
    args: &'a [Value],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(args: &'a [Value]) -> Self {
        Self { args, pos: 0 }
    }

    /// Pop the next argument if it is a `u32`; the cursor does not move otherwise.
    pub fn pop_u32(&mut self) -> Option<u32> {
        let value = self.args.get(self.pos)?.as_u32()?;
        self.pos += 1;
        Some(value)
    }

    pub fn pop_bool(&mut self) -> Option<bool> {
        match self.args.get(self.pos)? {
            Value::Bool(b) => {
                self.pos += 1;
                Some(*b)
            }
            _ => None,
        }
    }
}
