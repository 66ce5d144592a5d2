use crate::{
    error::AttachError,
    protocol::{Command, ProtocolVariant},
};

/// An immutable, validated attach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    command: Command,
    args: Vec<String>,
}

impl AttachRequest {
    /// Builds a request, checking it against the most permissive framing.
    ///
    /// `jcmd` arguments are joined with spaces into a single field: the listener expects the
    /// whole diagnostic command line as one argument.
    pub fn new<C, I, S>(command: C, args: I) -> Result<Self, AttachError>
    where
        C: Into<Command>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        let mut args = args.into_iter().map(Into::into).collect::<Vec<String>>();

        if command.as_str().is_empty() {
            return Err(AttachError::InvalidArgument(
                "command name is empty".to_owned(),
            ));
        }
        if command == Command::Jcmd && args.len() > 1 {
            args = vec![args.join(" ")];
        }
        for field in std::iter::once(command.as_str()).chain(args.iter().map(String::as_str)) {
            if field.contains('\0') {
                return Err(AttachError::InvalidArgument(format!(
                    "field {field:?} contains a NUL byte"
                )));
            }
        }

        let request = Self { command, args };
        request.check(ProtocolVariant::Extended)?;
        Ok(request)
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Checks that the request can be framed with `variant` without losing anything.
    pub fn check(&self, variant: ProtocolVariant) -> Result<(), AttachError> {
        let name = self.command.as_str();
        if self.args.len() > variant.max_args() {
            return Err(AttachError::InvalidArgument(format!(
                "`{name}` got {} arguments, the {variant} protocol carries at most {}",
                self.args.len(),
                variant.max_args()
            )));
        }
        match variant {
            ProtocolVariant::Legacy => {
                if name.len() > ProtocolVariant::LEGACY_MAX_NAME_LEN {
                    return Err(AttachError::InvalidArgument(format!(
                        "command name `{name}` is longer than {} bytes",
                        ProtocolVariant::LEGACY_MAX_NAME_LEN
                    )));
                }
                if let Some(arg) = self
                    .args
                    .iter()
                    .find(|arg| arg.len() > ProtocolVariant::LEGACY_MAX_ARG_LEN)
                {
                    return Err(AttachError::InvalidArgument(format!(
                        "argument of {} bytes exceeds the {variant} limit of {} bytes",
                        arg.len(),
                        ProtocolVariant::LEGACY_MAX_ARG_LEN
                    )));
                }
            }
            ProtocolVariant::Extended => {
                let body_len = self.body_len();
                if body_len > ProtocolVariant::EXTENDED_MAX_BODY_LEN {
                    return Err(AttachError::InvalidArgument(format!(
                        "request of {body_len} bytes exceeds the {variant} limit of {} bytes",
                        ProtocolVariant::EXTENDED_MAX_BODY_LEN
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn fits(&self, variant: ProtocolVariant) -> bool {
        self.check(variant).is_ok()
    }

    /// Serializes the request into a single frame.
    pub fn encode(&self, variant: ProtocolVariant) -> Result<Vec<u8>, AttachError> {
        self.check(variant)?;
        let mut frame = Vec::new();
        push_field(&mut frame, variant.version_token());
        match variant {
            ProtocolVariant::Legacy => {
                push_field(&mut frame, self.command.as_str());
                for slot in 0..ProtocolVariant::LEGACY_MAX_ARGS {
                    push_field(&mut frame, self.args.get(slot).map_or("", String::as_str));
                }
            }
            ProtocolVariant::Extended => {
                push_field(&mut frame, &self.body_len().to_string());
                push_field(&mut frame, self.command.as_str());
                for arg in &self.args {
                    push_field(&mut frame, arg);
                }
            }
        }
        Ok(frame)
    }

    fn body_len(&self) -> usize {
        self.command.as_str().len() + 1 + self.args.iter().map(|arg| arg.len() + 1).sum::<usize>()
    }
}

fn push_field(frame: &mut Vec<u8>, field: &str) {
    frame.extend_from_slice(field.as_bytes());
    frame.push(0);
}

/// A request as seen by a listener.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedRequest {
    pub(crate) variant: ProtocolVariant,
    pub(crate) command: Command,
    /// Arguments, without the empty padding slots of the legacy framing.
    pub(crate) args: Vec<String>,
    /// Number of bytes of the frame.
    pub(crate) len: usize,
}

/// Decodes a request frame from the beginning of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete.
#[cfg(test)]
pub(crate) fn decode_request(buf: &[u8]) -> Result<Option<DecodedRequest>, AttachError> {
    let mut fields = Fields { buf, pos: 0 };
    let Some(version) = fields.next_field()? else {
        return Ok(None);
    };
    let variant = match version.as_str() {
        "1" => ProtocolVariant::Legacy,
        "2" => ProtocolVariant::Extended,
        other => {
            return Err(AttachError::InvalidArgument(format!(
                "unsupported protocol version {other:?}"
            )))
        }
    };

    let mut values = Vec::new();
    match variant {
        ProtocolVariant::Legacy => {
            for _ in 0..=ProtocolVariant::LEGACY_MAX_ARGS {
                let Some(field) = fields.next_field()? else {
                    return Ok(None);
                };
                values.push(field);
            }
            while values.last().is_some_and(String::is_empty) {
                values.pop();
            }
        }
        ProtocolVariant::Extended => {
            let Some(size) = fields.next_field()? else {
                return Ok(None);
            };
            let size: usize = size.parse().map_err(|_| {
                AttachError::InvalidArgument(format!("invalid body size {size:?}"))
            })?;
            let end = fields.pos.saturating_add(size);
            if buf.len() < end {
                return Ok(None);
            }
            let mut body = Fields {
                buf: &buf[..end],
                pos: fields.pos,
            };
            while body.pos < end {
                match body.next_field()? {
                    Some(field) => values.push(field),
                    None => {
                        return Err(AttachError::InvalidArgument(
                            "body is not NUL-terminated".to_owned(),
                        ))
                    }
                }
            }
            fields.pos = end;
        }
    }

    let mut values = values.into_iter();
    let command = values
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AttachError::InvalidArgument("missing command name".to_owned()))?;
    Ok(Some(DecodedRequest {
        variant,
        command: command.into(),
        args: values.collect(),
        len: fields.pos,
    }))
}

#[cfg(test)]
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

#[cfg(test)]
impl Fields<'_> {
    fn next_field(&mut self) -> Result<Option<String>, AttachError> {
        let rest = &self.buf[self.pos..];
        let Some(nul) = rest.iter().position(|b| *b == 0) else {
            return Ok(None);
        };
        let field = std::str::from_utf8(&rest[..nul])
            .map_err(|_| AttachError::InvalidArgument("field is not valid UTF-8".to_owned()))?;
        self.pos += nul + 1;
        Ok(Some(field.to_owned()))
    }
}
