//! Response shaping for compilation results.
//!
//! Queue-path results go back to the client either as JSON (default) or as a
//! plain-text rendering when the request's `Accept` header asks for
//! `text/plain`. Correlation bookkeeping fields are stripped first.

use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// ANSI CSI escape sequences (colors, cursor movement).
static ANSI_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex"));

const BANNER: &str = "# Compilation provided by Compiler Explorer at https://godbolt.org/";

/// Render a compilation result for the client.
///
/// Always 200; a failed compilation is conveyed by `code` in the body.
pub fn shape_response(mut result: Value, accept: Option<&str>, filter_ansi: bool) -> Response {
    if let Value::Object(fields) = &mut result {
        fields.remove("guid");
        fields.remove("s3Key");
    }

    let wants_text = accept
        .map(|accept| accept.contains("text/plain"))
        .unwrap_or(false);
    if wants_text {
        (
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            text_projection(&result, filter_ansi),
        )
            .into_response()
    } else {
        Json(result).into_response()
    }
}

/// Plain-text rendering: banner, assembly, compiler exit code when non-zero,
/// labelled output streams, then the execution result if there is one.
fn text_projection(result: &Value, filter_ansi: bool) -> String {
    let mut out = String::new();
    out.push_str(BANNER);
    out.push('\n');

    if let Some(asm) = result.get("asm").and_then(Value::as_array) {
        let lines: Vec<&str> = asm
            .iter()
            .filter_map(|line| line.get("text").and_then(Value::as_str))
            .collect();
        if !lines.is_empty() {
            out.push_str(&lines.join("\n"));
            out.push('\n');
        }
    }

    let code = result.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        out.push_str(&format!("\n# Compiler exited with result code {code}\n"));
    }

    push_stream(&mut out, "Stdout", result.get("stdout"));
    push_stream(&mut out, "Stderr", result.get("stderr"));

    if let Some(exec) = result.get("execResult").filter(|v| v.is_object()) {
        let exec_code = exec.get("code").and_then(Value::as_i64).unwrap_or(0);
        out.push_str(&format!("\n# Execution result with exit code {exec_code}\n"));
        push_stream(&mut out, "Stdout", exec.get("stdout"));
        push_stream(&mut out, "Stderr", exec.get("stderr"));
    }

    if filter_ansi {
        strip_ansi(&out)
    } else {
        out
    }
}

fn push_stream(out: &mut String, label: &str, lines: Option<&Value>) {
    let Some(lines) = lines.and_then(Value::as_array) else {
        return;
    };
    if lines.is_empty() {
        return;
    }
    out.push('\n');
    out.push_str(label);
    out.push_str(":\n");
    for line in lines {
        let text = line
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| line.as_str());
        if let Some(text) = text {
            out.push_str(text);
            out.push('\n');
        }
    }
}

/// Remove ANSI CSI sequences from projected text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_CSI.replace_all(text, "").into_owned()
}
