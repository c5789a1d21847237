//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Models like to wrap code in markdown fences even when told not to.
/// Returns the body of the first fenced block, or the trimmed input when there is none.
pub fn strip_code_fences(s: &str) -> String {
  let t = s.trim();
  let Some(start) = t.find("```") else { return t.to_string() };
  let after = &t[start + 3..];
  // Skip the info string (```html, ```javascript, ...).
  let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
  let body = &after[body_start..];
  match body.rfind("```") {
    Some(end) => body[..end].trim_end().to_string(),
    None => body.trim_end().to_string(),
  }
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) { cut -= 1; }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}

/// File name usable inside archives and Content-Disposition headers.
pub fn safe_file_stem(s: &str) -> String {
  let cleaned: String = s
    .trim()
    .chars()
    .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') { c } else { '_' })
    .collect();
  let cleaned = cleaned.trim_matches('.').trim().to_string();
  if cleaned.is_empty() { "untitled".into() } else { cleaned }
}
