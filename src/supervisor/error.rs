//! Supervisor 전용 에러 타입 — 헬퍼 프로세스 실패와 출력 파싱 실패를
//! 구분하여 호출자가 문자열 매칭 없이 분기할 수 있게 합니다.

use thiserror::Error;

/// Errors raised by helper process supervision.
///
/// `ProcessFailure` covers every way a launch can go wrong: a non-zero
/// exit, a failed spawn, a missed wait bound, an unreadable log file, or
/// a pid-file that cannot be read or parsed. `Decode` is deliberately
/// separate: the introspection tool can exit cleanly and still hand us
/// garbage, and callers must be able to tell the two apart.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("unable to start [{program}]: [{diagnostic}]")]
    ProcessFailure { program: String, diagnostic: String },

    #[error("invalid JSON from [{program}]: {source}")]
    Decode {
        program: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SupervisorError {
    pub fn process(program: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::ProcessFailure {
            program: program.into(),
            diagnostic: diagnostic.into(),
        }
    }
}
