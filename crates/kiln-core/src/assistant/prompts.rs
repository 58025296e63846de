//! Prompt templates for the hosted assistant.

use crate::capabilities::{FileSummary, RankingCandidate, RunOutputs};

const NO_PROSE: &str =
    "Return only the complete Python program, with no explanations and no code fences.";

const REQUIREMENTS_FORMAT: &str = "Return only a requirements.txt list, one package per line \
(package==version when you are sure of it). No explanations, no comments, no code fences. \
Return an empty answer when nothing beyond the standard library is needed.";

fn render_history(history: &[String]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("Previous attempts:\n");
    for entry in history {
        out.push_str(entry);
        out.push_str("\n\n");
    }
    out
}

pub fn generate(prompt: &str, files: &[FileSummary]) -> String {
    let mut text = format!(
        "Write a Python 3 program for the following task:\n{}\n\n",
        prompt
    );
    if !files.is_empty() {
        text.push_str(
            "The program runs in a directory that also contains these input files:\n",
        );
        for file in files {
            text.push_str(&file.describe());
            text.push_str("\n\n");
        }
    }
    text.push_str(
        "Write any output files to the current directory. Print a short summary of what was done.\n",
    );
    text.push_str(NO_PROSE);
    text
}

pub fn dependencies(code: &str) -> String {
    format!(
        "Given this Python program:\n{}\n\nList the third-party packages it needs to run in an \
         isolated environment. Input files live next to the script.\n{}",
        code, REQUIREMENTS_FORMAT
    )
}

pub fn refine_code(code: &str, outputs: &RunOutputs, history: &[String]) -> String {
    format!(
        "This Python program failed:\n{}\n\nstdout:\n{}\n\nstderr:\n{}\n\n{}\
         Fix the program so it runs cleanly. {}",
        code,
        outputs.stdout,
        outputs.stderr,
        render_history(history),
        NO_PROSE
    )
}

pub fn refine_dependencies(
    dependencies: &[String],
    code: &str,
    outputs: &RunOutputs,
    history: &[String],
) -> String {
    format!(
        "This Python program:\n{}\n\nwas run with these requirements:\n{}\n\nand produced:\n{}\n{}\n\n{}\
         Correct only the requirements list so the program can run. {}",
        code,
        dependencies.join("\n"),
        outputs.stdout,
        outputs.stderr,
        render_history(history),
        REQUIREMENTS_FORMAT
    )
}

pub fn improve(code: &str, instructions: &str) -> String {
    format!(
        "Current Python program:\n{}\n\nModify it according to these instructions:\n{}\n\n\
         Input files live next to the script. {}",
        code, instructions, NO_PROSE
    )
}

pub fn classify(combined_output: &str) -> String {
    format!(
        "Classify the result of running a Python program from its output:\n{}\n\n\
         Answer with exactly one word:\n\
         OK if it ran without errors\n\
         DEPENDENCY if a package is missing or fails to import\n\
         CODE if the program itself is wrong\n\
         BOTH if there are dependency and code problems\n\
         UNKNOWN if you cannot tell",
        combined_output
    )
}

pub fn rank(candidates: &[RankingCandidate]) -> String {
    let mut text = String::from(
        "Several programs solved the same task. Pick the best one by correctness, \
         completeness of the output and quality of the produced files.\n\n",
    );
    for (position, candidate) in candidates.iter().enumerate() {
        let dependencies = if candidate.dependencies.is_empty() {
            "none".to_string()
        } else {
            candidate.dependencies.join(", ")
        };
        text.push_str(&format!(
            "Solution {}:\n{}\n\nDependencies: {}\n\nOutput:\n{}\n\nErrors:\n{}\n\nFiles:\n",
            position,
            candidate.code,
            dependencies,
            candidate.outputs.stdout,
            candidate.outputs.stderr
        ));
        for file in FileSummary::summarize(&candidate.produced_files) {
            text.push_str(&file.describe());
            text.push('\n');
        }
        text.push('\n');
    }
    text.push_str("Answer with JSON only, for example {\"best\": 0}.");
    text
}

pub fn report(prompt: &str, files: &[FileSummary]) -> String {
    let mut text = format!(
        "Write a Markdown report for this task:\n{}\n\nThe solution left these files:\n",
        prompt
    );
    for file in files {
        text.push_str(&file.describe());
        text.push_str("\n\n");
    }
    text.push_str(
        "Explain the approach, the results and what each file contains. \
         Reference images by file name.",
    );
    text
}
