//! Low-level JavaScript source emission.

/// Accumulates generated JavaScript with two-space indentation and a
/// stream stack for out-of-order emission: a function body is buffered
/// first so the declaration line at its top can name every local the
/// body turned out to use.
pub struct JsWriter {
    streams: Vec<String>,
    indentation: usize,
    pending_newlines: usize,
    wrote_anything: bool,
}

impl JsWriter {
    pub fn new() -> Self {
        JsWriter {
            streams: vec![String::new()],
            indentation: 0,
            pending_newlines: 0,
            wrote_anything: false,
        }
    }

    pub fn indent(&mut self) {
        self.indentation += 1;
    }

    pub fn outdent(&mut self) {
        debug_assert!(self.indentation > 0);
        self.indentation -= 1;
    }

    /// Write a fragment, flushing any pending line breaks first.
    /// Consecutive `newline` calls coalesce into a single break.
    pub fn write(&mut self, fragment: &str) {
        if self.pending_newlines > 0 || !self.wrote_anything {
            let prefix = if self.wrote_anything {
                "\n".repeat(self.pending_newlines)
            } else {
                String::new()
            };
            let indent = "  ".repeat(self.indentation);
            let stream = self.current();
            stream.push_str(&prefix);
            stream.push_str(&indent);
            self.pending_newlines = 0;
        }
        self.wrote_anything = true;
        self.current().push_str(fragment);
    }

    pub fn newline(&mut self) {
        self.pending_newlines = 1;
    }

    /// Write a full line: break, then the fragment.
    pub fn write_line(&mut self, line: &str) {
        self.newline();
        self.write(line);
    }

    /// Write a string literal with JSON escaping.
    pub fn write_quoted(&mut self, text: &str) {
        let quoted = serde_json::Value::String(text.to_string()).to_string();
        self.write(&quoted);
    }

    /// Redirect subsequent writes into a fresh buffer.
    pub fn start_buffering(&mut self) {
        self.streams.push(String::new());
    }

    /// Stop buffering and return the buffered source.
    pub fn end_buffering(&mut self) -> String {
        debug_assert!(self.streams.len() > 1);
        match self.streams.pop() {
            Some(buffered) => buffered,
            None => unreachable!("buffer stack underflow"),
        }
    }

    /// Splice previously buffered source into the current stream as-is.
    pub fn write_buffered(&mut self, buffered: &str) {
        self.current().push_str(buffered);
    }

    pub fn finish(mut self) -> String {
        debug_assert_eq!(self.streams.len(), 1);
        let mut source = match self.streams.pop() {
            Some(stream) => stream,
            None => unreachable!("stream stack underflow"),
        };
        source.push('\n');
        source
    }

    fn current(&mut self) -> &mut String {
        match self.streams.last_mut() {
            Some(stream) => stream,
            None => unreachable!("stream stack underflow"),
        }
    }
}

impl Default for JsWriter {
    fn default() -> Self {
        JsWriter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_indentation_and_coalescing() {
        let mut w = JsWriter::new();
        w.write("function f() {");
        w.indent();
        w.write_line("return 1;");
        w.newline();
        w.newline();
        w.outdent();
        w.write_line("}");
        assert_eq!(w.finish(), "function f() {\n  return 1;\n}\n");
    }

    #[test]
    fn test_buffering_splices_raw() {
        let mut w = JsWriter::new();
        w.write("function f() {");
        w.indent();
        w.start_buffering();
        w.write_line("g();");
        let body = w.end_buffering();
        w.write_line("var a;");
        w.write_buffered(&body);
        w.outdent();
        w.write_line("}");
        assert_eq!(w.finish(), "function f() {\n  var a;\n  g();\n}\n");
    }

    #[test]
    fn test_quoting() {
        let mut w = JsWriter::new();
        w.write_quoted("he said \"hi\"\n");
        assert_eq!(w.finish(), "\"he said \\\"hi\\\"\\n\"\n");
    }
}
