use bytes::{BufMut, Bytes, BytesMut};

/// One outbound command: an ordered list of byte-string arguments.
///
/// Every command is written as an array of bulk strings regardless of
/// protocol level; inline commands are never produced.
#[derive(Clone, Debug)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<Bytes>) -> Command {
        Command {
            args: vec![name.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The uppercased command token.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_uppercase()
    }

    /// Diagnostic label attached to the pending slot. `KEYS` keeps its full
    /// argument list so the pattern shows up alongside the verb.
    pub fn label(&self) -> String {
        let name = self.name();
        if name == "KEYS" {
            let mut label = name;
            for arg in &self.args[1..] {
                label.push(' ');
                label.push_str(&String::from_utf8_lossy(arg));
            }
            label
        } else {
            name
        }
    }

    /// Arguments after the verb, lossily decoded. Subscription commands use
    /// this to recover the channel and pattern names they carry.
    pub fn tail_strings(&self) -> Vec<String> {
        self.args[1..]
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect()
    }

    // *<n>\r\n followed by each argument as $<len>\r\n<bytes>\r\n
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u8(b'*');
        dst.put_slice(self.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for arg in &self.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        self.write_to(&mut buffer);
        buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_single_argument_command() {
        let command = Command::new("PING");
        assert_eq!(&command.to_bytes()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn encode_binary_argument() {
        let command = Command::new("SET")
            .arg("key")
            .arg(Bytes::from_static(b"a\r\nb\0c"));
        assert_eq!(
            &command.to_bytes()[..],
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$6\r\na\r\nb\0c\r\n"
        );
    }

    #[test]
    fn label_is_uppercased_verb() {
        let command = Command::new("get").arg("foo");
        assert_eq!(command.label(), "GET");
    }

    #[test]
    fn label_for_keys_joins_arguments() {
        let command = Command::new("keys").arg("user:*");
        assert_eq!(command.label(), "KEYS user:*");
    }
}
