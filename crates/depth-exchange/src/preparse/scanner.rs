//! 첫 객체 레벨만 훑는 JSON 스캐너.
//!
//! 원하는 문자열 속성을 찾는 즉시 멈추고, 다른 값은 구조만 검사하며 건너뜁니다.
//! 버퍼 끝에 도달하면 `Incomplete`를 돌려주므로 메시지 조각이 도착하는 대로
//! 다시 실행할 수 있습니다. 어떤 입력에도 패닉하지 않습니다.

/// 중첩 한도 (serde_json 재귀 한도와 같음).
const MAX_DEPTH: usize = 128;

/// 라우팅 키 위치.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePath {
    /// 첫 레벨의 문자열 속성
    Field(&'static str),
    /// 첫 레벨 객체 하나 안의 문자열 속성 (OKX `arg.instId`)
    Nested {
        object: &'static str,
        field: &'static str,
    },
}

/// 스캔 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome<'a> {
    /// 찾은 문자열의 원시 내용 (따옴표 제외, 이스케이프 미해석)
    Found(&'a [u8]),
    /// 첫 레벨 객체가 끝날 때까지 없음
    Absent,
    /// 판단하려면 바이트가 더 필요
    Incomplete,
    /// JSON 문법 위반
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Incomplete,
    Invalid,
}

type Step<T> = Result<T, Stop>;

/// `bytes`의 첫 레벨에서 `paths` 중 먼저 나오는 문자열 값을 찾습니다.
pub fn scan<'a>(bytes: &'a [u8], paths: &[RoutePath]) -> ScanOutcome<'a> {
    let mut scanner = Scanner::new(bytes);
    match scanner.scan_root(paths) {
        Ok(Some(raw)) => ScanOutcome::Found(raw),
        Ok(None) => ScanOutcome::Absent,
        Err(Stop::Incomplete) => ScanOutcome::Incomplete,
        Err(Stop::Invalid) => ScanOutcome::Invalid,
    }
}

/// 전체 문서가 올바른 JSON인지 검사합니다 (할당 없음).
pub fn is_valid_document(bytes: &[u8]) -> bool {
    let mut scanner = Scanner::new(bytes);
    scanner.skip_ws();
    if scanner.skip_value(0).is_err() {
        return false;
    }
    scanner.skip_ws();
    scanner.at_end()
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Step<u8> {
        self.bytes.get(self.pos).copied().ok_or(Stop::Incomplete)
    }

    fn peek_opt(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.bytes.get(self.pos) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Step<()> {
        if self.peek()? == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(Stop::Invalid)
        }
    }

    fn scan_root(&mut self, paths: &[RoutePath]) -> Step<Option<&'a [u8]>> {
        self.skip_ws();
        self.expect(b'{')?;
        self.skip_ws();
        if self.peek()? == b'}' {
            return Ok(None);
        }

        loop {
            let name = self.read_string_span()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();

            let next = self.peek()?;
            let mut consumed = false;
            for path in paths {
                match *path {
                    RoutePath::Field(field) if next == b'"' && name == field.as_bytes() => {
                        return self.read_string_span().map(Some);
                    }
                    RoutePath::Nested { object, field }
                        if next == b'{' && name == object.as_bytes() =>
                    {
                        if let Some(found) = self.scan_nested(field)? {
                            return Ok(Some(found));
                        }
                        consumed = true;
                        break;
                    }
                    _ => {}
                }
            }
            if !consumed {
                self.skip_value(1)?;
            }

            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b'}' => return Ok(None),
                _ => return Err(Stop::Invalid),
            }
        }
    }

    fn scan_nested(&mut self, field: &str) -> Step<Option<&'a [u8]>> {
        self.expect(b'{')?;
        self.skip_ws();
        if self.peek()? == b'}' {
            self.pos += 1;
            return Ok(None);
        }

        loop {
            let name = self.read_string_span()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            if name == field.as_bytes() && self.peek()? == b'"' {
                return self.read_string_span().map(Some);
            }
            self.skip_value(2)?;
            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b'}' => {
                    self.pos += 1;
                    return Ok(None);
                }
                _ => return Err(Stop::Invalid),
            }
        }
    }

    /// 여는 따옴표부터 문자열을 읽고 내용 구간을 반환합니다.
    fn read_string_span(&mut self) -> Step<&'a [u8]> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.peek()? {
                b'"' => {
                    let span = &self.bytes[start..self.pos];
                    self.pos += 1;
                    if std::str::from_utf8(span).is_err() {
                        return Err(Stop::Invalid);
                    }
                    return Ok(span);
                }
                b'\\' => {
                    self.pos += 1;
                    self.skip_escape()?;
                }
                0x00..=0x1f => return Err(Stop::Invalid),
                _ => self.pos += 1,
            }
        }
    }

    fn skip_escape(&mut self) -> Step<()> {
        match self.peek()? {
            b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => {
                self.pos += 1;
                Ok(())
            }
            b'u' => {
                self.pos += 1;
                match self.read_hex4()? {
                    0xD800..=0xDBFF => {
                        self.expect(b'\\')?;
                        self.expect(b'u')?;
                        if (0xDC00..=0xDFFF).contains(&self.read_hex4()?) {
                            Ok(())
                        } else {
                            Err(Stop::Invalid)
                        }
                    }
                    0xDC00..=0xDFFF => Err(Stop::Invalid),
                    _ => Ok(()),
                }
            }
            _ => Err(Stop::Invalid),
        }
    }

    fn read_hex4(&mut self) -> Step<u32> {
        let mut value = 0u32;
        for _ in 0..4 {
            let digit = match self.peek()? {
                b @ b'0'..=b'9' => b - b'0',
                b @ b'a'..=b'f' => b - b'a' + 10,
                b @ b'A'..=b'F' => b - b'A' + 10,
                _ => return Err(Stop::Invalid),
            };
            value = value * 16 + digit as u32;
            self.pos += 1;
        }
        Ok(value)
    }

    fn skip_value(&mut self, depth: usize) -> Step<()> {
        match self.peek()? {
            b'"' => self.read_string_span().map(|_| ()),
            b'{' => self.skip_object(depth + 1),
            b'[' => self.skip_array(depth + 1),
            b't' => self.literal(b"true"),
            b'f' => self.literal(b"false"),
            b'n' => self.literal(b"null"),
            b'-' | b'0'..=b'9' => self.skip_number(),
            _ => Err(Stop::Invalid),
        }
    }

    fn skip_object(&mut self, depth: usize) -> Step<()> {
        if depth >= MAX_DEPTH {
            return Err(Stop::Invalid);
        }
        self.expect(b'{')?;
        self.skip_ws();
        if self.peek()? == b'}' {
            self.pos += 1;
            return Ok(());
        }

        loop {
            self.read_string_span()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            self.skip_value(depth)?;
            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b'}' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(Stop::Invalid),
            }
        }
    }

    fn skip_array(&mut self, depth: usize) -> Step<()> {
        if depth >= MAX_DEPTH {
            return Err(Stop::Invalid);
        }
        self.expect(b'[')?;
        self.skip_ws();
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(());
        }

        loop {
            self.skip_value(depth)?;
            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b']' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(Stop::Invalid),
            }
        }
    }

    fn literal(&mut self, word: &[u8]) -> Step<()> {
        for &expected in word {
            if self.peek()? != expected {
                return Err(Stop::Invalid);
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek_opt(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn skip_number(&mut self) -> Step<()> {
        if self.peek()? == b'-' {
            self.pos += 1;
        }
        match self.peek()? {
            b'0' => self.pos += 1,
            b'1'..=b'9' => self.skip_digits(),
            _ => return Err(Stop::Invalid),
        }
        if self.peek_opt() == Some(b'.') {
            self.pos += 1;
            if !self.peek()?.is_ascii_digit() {
                return Err(Stop::Invalid);
            }
            self.skip_digits();
        }
        if matches!(self.peek_opt(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek()?, b'+' | b'-') {
                self.pos += 1;
            }
            if !self.peek()?.is_ascii_digit() {
                return Err(Stop::Invalid);
            }
            self.skip_digits();
        }
        // 버퍼 끝의 숫자는 다음 조각에서 이어질 수 있음
        if self.at_end() {
            return Err(Stop::Incomplete);
        }
        Ok(())
    }
}
