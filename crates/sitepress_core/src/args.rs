/// Split a command line into tokens.
///
/// Quotes group words and are dropped, a backslash takes the next character
/// literally (inside quotes too), and an unterminated quote simply ends the
/// last token. Tokens that still contain whitespace come back re-quoted so the
/// joined result can be handed to a shell unchanged.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escape = false;

    for ch in command.chars() {
        if escape {
            current.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        if let Some(active) = quote {
            if ch == active {
                quote = None;
            } else {
                current.push(ch);
            }
            continue;
        }
        if ch == '\'' || ch == '"' {
            quote = Some(ch);
            continue;
        }
        if ch.is_whitespace() {
            flush(&mut tokens, &mut current);
            continue;
        }
        current.push(ch);
    }
    flush(&mut tokens, &mut current);

    tokens
        .into_iter()
        .map(|token| {
            if token.chars().any(char::is_whitespace) {
                quote_token(&token)
            } else {
                token
            }
        })
        .collect()
}

/// Wrap a token in double quotes, escaping the characters a POSIX shell
/// still interprets inside them.
pub fn quote_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for ch in token.chars() {
        if matches!(ch, '"' | '$' | '`' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Undo [`quote_token`]. Tokens that were not re-quoted pass through.
pub fn unquote_token(token: &str) -> String {
    let Some(inner) = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return token.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\'
            && let Some(next) = chars.peek().copied()
            && matches!(next, '"' | '$' | '`' | '\\')
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(ch);
    }
    out
}

/// Join tokens back into a single command line.
pub fn join_tokens(tokens: &[String]) -> String {
    tokens.join(" ")
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}
