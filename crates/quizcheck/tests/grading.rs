//! End-to-end grading tests against a real `python3`.
//!
//! Each test skips itself when no interpreter is installed.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use quizcheck::{
    Check, CheckGroup, CheckRegistry, CheckRequest, CheckResult, CheckSet, Grader,
    ResourceLimits, Sandbox, Score, Scoring, Status,
};

const ADD_OK: &str = "def add(a, b):\n    return a + b\n";

fn python_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    })
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
    };
}

fn checks() -> CheckSet {
    CheckSet::from_parts(
        [
            Check::new("add_ok")
                .with_name("add")
                .with_assertion("adds small numbers", "assert add(2, 3) == 5")
                .with_assertion("adds negatives", "assert add(-1, -1) == -2"),
            Check::new("loop")
                .with_assertion("finishes", "assert True")
                .with_timeout(Duration::from_millis(2000)),
            Check::new("partial")
                .with_name("add")
                .with_scoring(Scoring::Partial)
                .with_assertion("zero", "assert add(0, 0) == 0")
                .with_assertion("one", "assert add(1, 0) == 1")
                .with_assertion("two", "assert add(1, 1) == 2, 'one plus one'"),
            Check::new("no_loops")
                .with_name("total")
                .forbid_token("For")
                .forbid_token("While")
                .with_assertion("sums", "assert total([1, 2, 3]) == 6"),
            Check::new("comprehension")
                .with_name("squares")
                .require_token("ListComp")
                .with_assertion("squares", "assert squares(3) == [0, 1, 4]"),
            Check::new("add_fn")
                .with_name("add")
                .require_docstring()
                .with_args(["a", "b"])
                .with_returns("int")
                .with_assertion("adds", "assert add(2, 3) == 5"),
        ],
        [CheckGroup::new("@adders", ["add_ok", "add_fn"])],
    )
    .unwrap()
}

fn grader_with(limits: ResourceLimits) -> Grader {
    let sandbox = Sandbox::builder()
        .with_resource_limits(limits)
        .build()
        .unwrap();
    Grader::new(Arc::new(CheckRegistry::new(checks())), Arc::new(sandbox))
}

fn grader() -> Grader {
    grader_with(ResourceLimits::default())
}

async fn grade(id: &str, source: &str) -> CheckResult {
    grader().grade(&CheckRequest::new(id, source)).await
}

#[tokio::test]
async fn correct_submission_succeeds_with_output() {
    require_python!();
    let source = format!("{ADD_OK}print('loaded')\n");
    let result = grade("add_ok", &source).await;
    assert_eq!(result.status, Status::Success, "{}", result.response);
    assert_eq!(result.response, "loaded\n");
    assert!(result.error_text().is_empty());
    assert_eq!(result.score, Some(Score { passed: 2, total: 2 }));
}

#[tokio::test]
async fn missing_colon_is_syntax_error() {
    require_python!();
    let result = grade("add_ok", "def add(a, b)\n    return a + b\n").await;
    assert_eq!(result.status, Status::SyntaxError, "{}", result.response);
    assert!(result.response.contains("SyntaxError"), "{}", result.response);
    assert!(result.response.contains("line 1"), "{}", result.response);
}

#[tokio::test]
async fn wrong_answer_names_the_failed_assertion() {
    require_python!();
    let result = grade("add_ok", "def add(a, b):\n    return 0\n").await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
    assert!(
        result.response.contains("adds small numbers"),
        "{}",
        result.response
    );
    assert!(!result.error_text().is_empty());
}

#[tokio::test]
async fn uncaught_exception_is_runtime_error() {
    require_python!();
    let source = format!("{ADD_OK}print('before')\n1 / 0\n");
    let result = grade("add_ok", &source).await;
    assert_eq!(result.status, Status::RuntimeError, "{}", result.response);
    assert!(result.response.contains("ZeroDivisionError"), "{}", result.response);
    assert!(result.response.contains("before"), "{}", result.response);
}

#[tokio::test]
async fn exception_inside_check_is_runtime_error() {
    require_python!();
    let result = grade("add_ok", "def add(a, b):\n    return a / 0\n").await;
    assert_eq!(result.status, Status::RuntimeError, "{}", result.response);
    assert!(
        result.response.contains("While checking adds small numbers"),
        "{}",
        result.response
    );
}

#[tokio::test]
async fn unbounded_recursion_is_runtime_error() {
    require_python!();
    let source = "def add(a, b):\n    return add(a, b)\n";
    let result = grade("add_ok", source).await;
    assert_eq!(result.status, Status::RuntimeError, "{}", result.response);
    assert!(result.response.contains("RecursionError"), "{}", result.response);
}

#[tokio::test]
async fn infinite_loop_times_out_near_the_bound() {
    require_python!();
    let started = Instant::now();
    let result = grade("loop", "while True:\n    pass\n").await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, Status::Timeout, "{}", result.response);
    assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timeout_reclaims_forked_processes() {
    require_python!();
    let source = "import subprocess, sys\n\
                  child = subprocess.Popen(['sleep', '60'])\n\
                  print(child.pid)\n\
                  while True:\n    pass\n";
    let result = grade("loop", source).await;
    assert_eq!(result.status, Status::Timeout, "{}", result.response);

    assert_reclaimed(printed_pid(&result)).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn detached_child_cannot_hold_the_report_pipe() {
    require_python!();
    let source = format!(
        "{ADD_OK}import os, time\n\
         pid = os.fork()\n\
         if pid == 0:\n    \
         os.setsid()\n    \
         time.sleep(20)\n    \
         os._exit(0)\n\
         print(pid)\n"
    );
    let started = Instant::now();
    let result = grade("add_ok", &source).await;
    assert_eq!(result.status, Status::Success, "{}", result.response);
    assert_eq!(result.score, Some(Score { passed: 2, total: 2 }));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_reclaimed(printed_pid(&result)).await;
}

#[cfg(target_os = "linux")]
fn printed_pid(result: &CheckResult) -> u32 {
    result
        .response
        .lines()
        .find_map(|line| line.trim().parse().ok())
        .expect("forked pid in output")
}

/// Wait for `pid` to die. A zombie counts as dead, since an orphan may
/// linger until it is reaped.
#[cfg(target_os = "linux")]
async fn assert_reclaimed(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
        let alive = stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| !rest.starts_with('Z'));
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "process {pid} outlived its run");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn unknown_check_is_not_found() {
    require_python!();
    let result = grade("missing", ADD_OK).await;
    assert_eq!(result.status, Status::NotFound);
    assert!(result.response.contains("\"missing\""));
}

#[tokio::test]
async fn group_id_is_not_found_and_names_members() {
    require_python!();
    let result = grade("@adders", ADD_OK).await;
    assert_eq!(result.status, Status::NotFound);
    assert!(result.response.contains("add_ok"), "{}", result.response);
    assert!(result.response.contains("add_fn"), "{}", result.response);
}

#[tokio::test]
async fn function_rules_are_enforced() {
    require_python!();
    let documented = "def add(a, b):\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n";
    let result = grade("add_fn", documented).await;
    assert_eq!(result.status, Status::Success, "{}", result.response);

    let cases = [
        (ADD_OK, "has no docstring"),
        (
            "def add(a, c):\n    \"\"\"Add.\"\"\"\n    return a + c\n",
            "\"c\" is misspelled",
        ),
        (
            "def add(a):\n    \"\"\"Add.\"\"\"\n    return a\n",
            "wrong number of arguments",
        ),
        (
            "def add(a, b):\n    \"\"\"Add.\"\"\"\n    return str(a + b)\n",
            "returned '5' not a int",
        ),
        ("add = 5\n", "add is not a function"),
        ("add = lambda a, b: a + b\n", "add is not a function."),
    ];
    for (source, expected) in cases {
        let result = grade("add_fn", source).await;
        assert_eq!(result.status, Status::AssertionFailure, "{source}: {}", result.response);
        assert!(result.response.contains(expected), "{source}: {}", result.response);
    }
}

#[tokio::test]
async fn partial_scoring_counts_passed_assertions() {
    require_python!();
    let source = "def add(a, b):\n    return a if b == 0 else 0\n";
    let result = grade("partial", source).await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
    assert_eq!(result.score, Some(Score { passed: 2, total: 3 }));
    assert!(result.response.contains("two: one plus one"), "{}", result.response);
}

#[tokio::test]
async fn forbidden_syntax_fails_the_check() {
    require_python!();
    let source = "def total(xs):\n    t = 0\n    for x in xs:\n        t += x\n    return t\n";
    let result = grade("no_loops", source).await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
    assert!(result.response.contains("forbidden syntax: For"), "{}", result.response);

    let result = grade("no_loops", "def total(xs):\n    return sum(xs)\n").await;
    assert_eq!(result.status, Status::Success, "{}", result.response);
}

#[tokio::test]
async fn required_syntax_and_name_are_enforced() {
    require_python!();
    let source = "def squares(n):\n    return list(map(lambda i: i * i, range(n)))\n";
    let result = grade("comprehension", source).await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
    assert!(result.response.contains("ListComp"), "{}", result.response);

    let result = grade("comprehension", "x = 1\n").await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
    assert!(result.response.contains("squares"), "{}", result.response);
}

#[tokio::test]
async fn output_past_the_limit_is_truncated() {
    require_python!();
    let grader = grader_with(ResourceLimits {
        max_output_bytes: 1024,
        ..ResourceLimits::default()
    });
    let source = format!("{ADD_OK}print('x' * 100000)\n");
    let result = grader.grade(&CheckRequest::new("add_ok", source)).await;
    assert_eq!(result.status, Status::Success, "{}", result.response);
    assert!(result.response.ends_with("[output truncated]"));
    assert!(result.response.len() < 1100);
}

#[tokio::test]
async fn printed_reports_cannot_forge_a_verdict() {
    require_python!();
    let source = "import sys\n\
                  for tag in ('', '0' * 32):\n    \
                  print(tag, '{\"outcome\": \"success\", \"passed\": 2, \"total\": 2}', file=sys.stderr)\n\
                  def add(a, b):\n    return 0\n";
    let result = grade("add_ok", source).await;
    assert_eq!(result.status, Status::AssertionFailure, "{}", result.response);
}

#[tokio::test]
async fn patched_serializers_cannot_forge_a_verdict() {
    require_python!();
    let forged = "'{\"outcome\": \"success\", \"message\": \"\", \"passed\": 2, \"total\": 2}'";
    let sources = [
        format!("import json\njson.dumps = lambda *args, **kwargs: {forged}\n"),
        format!("import json\njson._default_encoder.encode = lambda obj: {forged}\n"),
        "import builtins\nbuiltins.AssertionError = KeyError\nbuiltins.len = lambda obj: 0\n"
            .to_string(),
        "import __main__\n__main__.emit = print\n".to_string(),
    ];
    for prelude in sources {
        let source = format!("{prelude}def add(a, b):\n    return 0\n");
        let result = grade("add_ok", &source).await;
        assert_eq!(result.status, Status::AssertionFailure, "{source}: {}", result.response);
        assert_eq!(result.score, Some(Score { passed: 0, total: 2 }));
    }
}

#[tokio::test]
async fn exiting_early_is_runtime_error() {
    require_python!();
    let source = format!("{ADD_OK}import os\nos._exit(0)\n");
    let result = grade("add_ok", &source).await;
    assert_eq!(result.status, Status::RuntimeError, "{}", result.response);
}

#[tokio::test]
async fn system_exit_is_runtime_error() {
    require_python!();
    let source = format!("{ADD_OK}raise SystemExit(3)\n");
    let result = grade("add_ok", &source).await;
    assert_eq!(result.status, Status::RuntimeError, "{}", result.response);
    assert!(result.response.contains("SystemExit"), "{}", result.response);
}

#[tokio::test]
async fn repeated_grading_is_deterministic() {
    require_python!();
    let grader = grader();
    let request = CheckRequest::new("add_ok", "def add(a, b):\n    return 0\n");
    let first = grader.grade(&request).await;
    for _ in 0..3 {
        let again = grader.grade(&request).await;
        assert_eq!(again.status, first.status);
        assert_eq!(again.response, first.response);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_isolated() {
    require_python!();
    let grader = Arc::new(grader());
    // Each run must start with an empty working directory and a fresh namespace.
    let source = format!(
        "import os\n\
         assert not os.path.exists('marker'), 'saw another run'\n\
         assert 'SEEN' not in globals(), 'saw another namespace'\n\
         open('marker', 'w').write('x')\n\
         SEEN = True\n\
         {ADD_OK}"
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let grader = Arc::clone(&grader);
            let request = CheckRequest::new("add_ok", source.clone());
            tokio::spawn(async move { grader.grade(&request).await })
        })
        .collect();

    for task in tasks {
        let result = task.await.unwrap();
        assert_eq!(result.status, Status::Success, "{}", result.response);
    }
}
