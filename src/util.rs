//! Small utility helpers used across modules.

/// Replace each `{key}` in the template with its value, pairs applied in order.
/// Later pairs also apply to text inserted by earlier ones.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Char-boundary-safe preview of a long string for log fields.
pub fn trunc_for_log(s: &str, max_chars: usize) -> String {
  match s.char_indices().nth(max_chars) {
    None => s.to_string(),
    Some((cut, _)) => format!("{}… ({} bytes total)", &s[..cut], s.len()),
  }
}

/// Pull the first JSON value (object or array) out of a model reply that may be
/// wrapped in code fences or surrounded by prose.
pub fn extract_json_block(text: &str) -> Option<&str> {
  let start = text.find(['{', '['])?;
  let open = text[start..].chars().next()?;
  let close = if open == '{' { '}' } else { ']' };
  let end = text.rfind(close)?;
  if end < start { return None; }
  Some(&text[start..=end])
}
