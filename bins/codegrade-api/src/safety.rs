//! Safety Gate
//!
//! Static, string-level screening of Java submissions before any compute is
//! spent on them. A submission is tested against an ordered list of named
//! rules; the first rule that matches rejects it with a human-readable reason.
//!
//! This gate is NOT the security boundary. It matches against the raw
//! source, so it can be fooled (unicode escapes, string concatenation of
//! class names) and it can also reject harmless code that merely mentions a
//! denied name in a comment. Isolation is enforced by the runner's
//! containers: no network, no capabilities, bounded pids and memory. The gate
//! exists to turn the obvious abuse attempts into a fast, explainable 400.

use regex::Regex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Process,
    Reflection,
    Filesystem,
    Network,
    Native,
    Sleep,
    Exit,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Process => "process",
            Category::Reflection => "reflection",
            Category::Filesystem => "filesystem",
            Category::Network => "network",
            Category::Native => "native",
            Category::Sleep => "sleep",
            Category::Exit => "exit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Rejects when the regex matches anywhere in the source
    Pattern(Regex),
    /// Rejects sleeps that are non-literal or exceed the per-call or
    /// summed ceilings
    SleepBudget { per_call_ms: u64, total_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct SafetyRule {
    pub name: String,
    pub category: Category,
    pub reason: String,
    pub matcher: Matcher,
}

impl SafetyRule {
    pub fn pattern(
        name: &str,
        category: Category,
        pattern: &str,
        reason: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            category,
            reason: reason.to_string(),
            matcher: Matcher::Pattern(Regex::new(pattern)?),
        })
    }

    pub fn sleep_budget(name: &str, per_call_ms: u64, total_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            category: Category::Sleep,
            reason: format!(
                "sleeping is limited to {}ms per call and {}ms in total",
                per_call_ms, total_ms
            ),
            matcher: Matcher::SleepBudget { per_call_ms, total_ms },
        }
    }

    /// Reason for rejecting `source`, if this rule applies to it
    fn violation(&self, source: &str, sleep_calls: &SleepScanner) -> Option<String> {
        match &self.matcher {
            Matcher::Pattern(re) => re.is_match(source).then(|| self.reason.clone()),
            Matcher::SleepBudget { per_call_ms, total_ms } => {
                sleep_calls.violation(source, *per_call_ms, *total_ms)
            }
        }
    }
}

/// Verdict of the gate. `rule` and `reason` are set only when unsafe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyCheck {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyCheck {
    fn safe() -> Self {
        Self {
            safe: true,
            rule: None,
            reason: None,
        }
    }
}

/// Finds `Thread.sleep(...)` and `TimeUnit.X.sleep(...)` calls.
#[derive(Debug, Clone)]
struct SleepScanner {
    call: Regex,
}

impl SleepScanner {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            call: Regex::new(
                r"(?:\bThread\s*\.\s*sleep|\bTimeUnit\s*\.\s*([A-Z]+)\s*\.\s*sleep)\s*\(([^)]*)\)",
            )?,
        })
    }

    fn violation(&self, source: &str, per_call_ms: u64, total_ms: u64) -> Option<String> {
        let mut total: u64 = 0;
        for caps in self.call.captures_iter(source) {
            let unit = caps.get(1).map(|m| m.as_str()).unwrap_or("MILLISECONDS");
            // Thread.sleep(millis, nanos): only the first argument matters
            let arg = caps
                .get(2)
                .map(|m| m.as_str())
                .unwrap_or("")
                .split(',')
                .next()
                .unwrap_or("")
                .trim();

            let Some(ms) = parse_literal(arg).and_then(|n| to_millis(n, unit)) else {
                return Some(format!("sleep with a non-literal duration `{}` is not allowed", arg));
            };
            if ms > per_call_ms {
                return Some(format!(
                    "sleep of {}ms exceeds the {}ms per-call limit",
                    ms, per_call_ms
                ));
            }
            total = total.saturating_add(ms);
            if total > total_ms {
                return Some(format!(
                    "sleeps add up to more than the {}ms budget",
                    total_ms
                ));
            }
        }
        None
    }
}

/// Integer literal as Java writes it: `1500`, `1_500`, `1500L`
fn parse_literal(arg: &str) -> Option<u64> {
    let digits: String = arg
        .trim_end_matches(['L', 'l'])
        .chars()
        .filter(|c| *c != '_')
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn to_millis(n: u64, unit: &str) -> Option<u64> {
    match unit {
        "NANOSECONDS" => Some(n / 1_000_000),
        "MICROSECONDS" => Some(n / 1_000),
        "MILLISECONDS" => Some(n),
        "SECONDS" => n.checked_mul(1_000),
        "MINUTES" => n.checked_mul(60_000),
        "HOURS" => n.checked_mul(3_600_000),
        "DAYS" => n.checked_mul(86_400_000),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    rules: Vec<SafetyRule>,
    sleeps: SleepScanner,
}

impl SafetyPolicy {
    pub fn new(rules: Vec<SafetyRule>) -> Result<Self, regex::Error> {
        Ok(Self {
            rules,
            sleeps: SleepScanner::new()?,
        })
    }

    /// Deny-list for Java submissions.
    pub fn java_default() -> Result<Self, regex::Error> {
        use Category::*;

        let rules = vec![
            // process
            SafetyRule::pattern(
                "runtime_exec",
                Process,
                r"\bRuntime\s*\.\s*getRuntime\b",
                "access to the Java runtime (process spawning, halting) is not allowed",
            )?,
            SafetyRule::pattern(
                "process_builder",
                Process,
                r"\bProcessBuilder\b",
                "spawning processes is not allowed",
            )?,
            SafetyRule::pattern(
                "process_handle",
                Process,
                r"\bProcessHandle\b",
                "inspecting or controlling processes is not allowed",
            )?,
            // reflection and dynamic code
            SafetyRule::pattern(
                "reflection",
                Reflection,
                r"\bjava\s*\.\s*lang\s*\.\s*reflect\b",
                "reflection is not allowed",
            )?,
            SafetyRule::pattern(
                "class_for_name",
                Reflection,
                r"\bClass\s*\.\s*forName\b",
                "loading classes by name is not allowed",
            )?,
            SafetyRule::pattern(
                "set_accessible",
                Reflection,
                r"\.\s*setAccessible\s*\(",
                "bypassing access checks is not allowed",
            )?,
            SafetyRule::pattern(
                "method_handles",
                Reflection,
                r"\bMethodHandles?\b",
                "method handles are not allowed",
            )?,
            SafetyRule::pattern(
                "class_loader",
                Reflection,
                r"\bClassLoader\b",
                "custom class loading is not allowed",
            )?,
            SafetyRule::pattern(
                "script_engine",
                Reflection,
                r"\bScriptEngine\w*\b",
                "evaluating scripts at runtime is not allowed",
            )?,
            // filesystem
            SafetyRule::pattern(
                "java_io_file",
                Filesystem,
                r"\bjava\s*\.\s*io\s*\.\s*File\w*|\bnew\s+File(?:InputStream|OutputStream|Reader|Writer)?\s*\(",
                "file system access is not allowed",
            )?,
            SafetyRule::pattern(
                "java_nio_file",
                Filesystem,
                r"\bjava\s*\.\s*nio\s*\.\s*file\b|\bFiles\s*\.\s*\w+\s*\(|\bPaths\s*\.\s*get\b",
                "file system access is not allowed",
            )?,
            SafetyRule::pattern(
                "random_access_file",
                Filesystem,
                r"\bRandomAccessFile\b",
                "file system access is not allowed",
            )?,
            // network
            SafetyRule::pattern(
                "java_net",
                Network,
                r"\bjava\s*\.\s*net\b",
                "network access is not allowed",
            )?,
            SafetyRule::pattern(
                "socket",
                Network,
                r"\b\w*Socket\w*\b",
                "opening sockets is not allowed",
            )?,
            SafetyRule::pattern(
                "http_client",
                Network,
                r"\bHttp\w*Client\b|\bHttpURLConnection\b",
                "network access is not allowed",
            )?,
            SafetyRule::pattern(
                "url",
                Network,
                r"\bURL\s*\(",
                "network access is not allowed",
            )?,
            // native code and JVM internals
            SafetyRule::pattern(
                "load_library",
                Native,
                r"\bSystem\s*\.\s*(?:loadLibrary|load)\s*\(",
                "loading native libraries is not allowed",
            )?,
            SafetyRule::pattern(
                "native_method",
                Native,
                r"\bnative\s+[\w<>\[\]]+\s+\w+\s*\(",
                "native methods are not allowed",
            )?,
            SafetyRule::pattern(
                "unsafe",
                Native,
                r"\bsun\s*\.\s*misc\b|\bUnsafe\b",
                "sun.misc.Unsafe is not allowed",
            )?,
            SafetyRule::pattern(
                "jdk_internal",
                Native,
                r"\bjdk\s*\.\s*internal\b",
                "JDK internals are not allowed",
            )?,
            // exit
            SafetyRule::pattern(
                "system_exit",
                Exit,
                r"\bSystem\s*\.\s*exit\s*\(",
                "terminating the JVM is not allowed; return from main instead",
            )?,
            SafetyRule::pattern(
                "runtime_halt",
                Exit,
                r"\.\s*halt\s*\(",
                "halting the JVM is not allowed",
            )?,
            // sleep
            SafetyRule::sleep_budget("sleep_budget", 1_000, 2_000),
        ];

        Self::new(rules)
    }

    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Screen `source`. Never fails; the first matching rule wins.
    pub fn check(&self, source: &str) -> SafetyCheck {
        for rule in &self.rules {
            if let Some(reason) = rule.violation(source, &self.sleeps) {
                return SafetyCheck {
                    safe: false,
                    rule: Some(rule.name.clone()),
                    reason: Some(reason),
                };
            }
        }
        SafetyCheck::safe()
    }
}
