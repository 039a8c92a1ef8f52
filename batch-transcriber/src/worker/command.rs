use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use super::{RecognitionError, Recognizer};
use crate::protocol::{decode_frame, encode_frame, DecodedAudio, RecognitionReply, Segment};

/// How to launch the recognition backend
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "uv".to_string(),
            args: vec!["run".to_string(), "python/recognize.py".to_string()],
            working_dir: None,
            env_vars: Vec::new(),
        }
    }
}

/// Recognizer that runs one backend process per file.
///
/// The request is written to stdin as a single hex-encoded MessagePack line
/// holding a `DecodedAudio`; the backend answers with one such line holding
/// a `RecognitionReply`. Other stdout lines are logged and ignored.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    config: CommandConfig,
}

impl CommandRecognizer {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(CommandConfig {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..CommandConfig::default()
        })
    }

    pub fn with_config(config: CommandConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Recognizer for CommandRecognizer {
    fn recognize(&self, audio: &DecodedAudio) -> Result<Vec<Segment>, RecognitionError> {
        let request = encode_frame(audio).map_err(|e| RecognitionError::Fatal(e.to_string()))?;

        let mut child = self.command().spawn().map_err(|e| {
            RecognitionError::Transient(format!("failed to spawn {}: {}", self.config.program, e))
        })?;
        debug!("Recognizer spawned with PID: {}", child.id());

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognitionError::Transient("failed to get stdin".to_string()))?;

        // write from another thread so a chatty backend cannot fill stdout and stall us
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                stdin.write_all(request.as_bytes())?;
                stdin.write_all(b"\n")?;
                stdin.flush()
            });
            let output = child.wait_with_output();
            if let Ok(Err(e)) = writer.join() {
                debug!("Recognizer closed stdin early: {}", e);
            }
            output
        })
        .map_err(|e| RecognitionError::Transient(format!("recognizer I/O failed: {}", e)))?;

        for line in BufReader::new(output.stderr.as_slice()).lines().map_while(Result::ok) {
            warn!("Recognizer stderr: {}", line);
        }

        let reply = BufReader::new(output.stdout.as_slice())
            .lines()
            .map_while(Result::ok)
            .find_map(|line| match decode_frame::<RecognitionReply>(&line) {
                Ok(reply) => Some(reply),
                Err(_) => {
                    debug!("Recognizer stdout: {}", line);
                    None
                }
            });

        let Some(reply) = reply else {
            return Err(RecognitionError::Transient(format!(
                "recognizer exited with {} without a reply",
                output.status
            )));
        };

        if reply.id != audio.id {
            return Err(RecognitionError::Transient(format!(
                "reply for {} does not match request {}",
                reply.id, audio.id
            )));
        }

        match reply.error {
            Some(error) if error.retryable => Err(RecognitionError::Transient(format!("{}: {}", error.code, error.message))),
            Some(error) => Err(RecognitionError::Fatal(format!("{}: {}", error.code, error.message))),
            None => Ok(reply.segments),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::utils::test_tone;

    fn shell(script: &str) -> CommandRecognizer {
        CommandRecognizer::new("sh", ["-c", script])
    }

    fn reply_script(reply: &RecognitionReply) -> String {
        format!("read _request; echo loading model; echo {}", encode_frame(reply).unwrap())
    }

    #[test]
    fn test_successful_reply() {
        let audio = test_tone("a.wav", 0.1, 16000);
        let reply = RecognitionReply::ok(audio.id, vec![Segment::new(0.0, 0.1, "beep", -0.1)]);

        let segments = shell(&reply_script(&reply)).recognize(&audio).unwrap();

        assert_eq!(segments, reply.segments);
    }

    #[test]
    fn test_backend_errors_keep_their_retryability() {
        let audio = test_tone("a.wav", 0.1, 16000);

        let busy = RecognitionReply::failed(audio.id, "gpu busy", "BUSY", true);
        assert!(matches!(
            shell(&reply_script(&busy)).recognize(&audio),
            Err(RecognitionError::Transient(_))
        ));

        let bad = RecognitionReply::failed(audio.id, "not speech", "INVALID", false);
        assert!(matches!(
            shell(&reply_script(&bad)).recognize(&audio),
            Err(RecognitionError::Fatal(_))
        ));
    }

    #[test]
    fn test_missing_reply_is_transient() {
        let audio = test_tone("a.wav", 0.1, 16000);

        let result = shell("read _request; echo oops >&2; exit 3").recognize(&audio);

        assert!(matches!(result, Err(RecognitionError::Transient(_))));
    }

    #[test]
    fn test_mismatched_reply_is_rejected() {
        let audio = test_tone("a.wav", 0.1, 16000);
        let other = RecognitionReply::ok(uuid::Uuid::new_v4(), Vec::new());

        assert!(shell(&reply_script(&other)).recognize(&audio).is_err());
    }

    #[test]
    fn test_missing_program_is_transient() {
        let audio = test_tone("a.wav", 0.1, 16000);
        let result = CommandRecognizer::new("definitely-not-a-recognizer", Vec::<String>::new()).recognize(&audio);
        assert!(matches!(result, Err(RecognitionError::Transient(_))));
    }
}
