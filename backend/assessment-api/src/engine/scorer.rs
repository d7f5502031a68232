use std::collections::HashMap;

use crate::models::{AssessmentDefinition, ScoreReport};

/// Grades a frozen set of answers against the definition.
///
/// Comparison is exact string equality, case sensitive, no trimming.
/// Unanswered questions count as incorrect. The percentage is an
/// integer rounded half up, and a definition with zero questions
/// scores 0 percent rather than dividing by zero.
pub fn score(definition: &AssessmentDefinition, answers: &HashMap<String, String>) -> ScoreReport {
    let total_count = definition.questions.len() as u32;
    if total_count == 0 {
        return ScoreReport {
            correct_count: 0,
            total_count: 0,
            percent: 0,
        };
    }

    let correct_count = definition
        .questions
        .iter()
        .filter(|q| answers.get(&q.id).is_some_and(|given| *given == q.correct_answer))
        .count() as u32;

    // Round half up: 2/3 -> 67, not 66.
    let percent = ((correct_count * 200 + total_count) / (2 * total_count)) as u8;

    ScoreReport {
        correct_count,
        total_count,
        percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Question, QuestionKind};

    fn definition(correct: &[(&str, &str)]) -> AssessmentDefinition {
        AssessmentDefinition {
            id: "def-1".to_string(),
            title: "Scoring fixture".to_string(),
            time_limit_seconds: 0,
            passing_score_percent: 50,
            questions: correct
                .iter()
                .map(|(id, answer)| Question {
                    id: id.to_string(),
                    prompt: format!("prompt {id}"),
                    kind: QuestionKind::FreeText,
                    correct_answer: answer.to_string(),
                })
                .collect(),
        }
    }

    fn answers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, value)| (id.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_two_of_three_rounds_up_to_67() {
        let def = definition(&[("q1", "a"), ("q2", "b"), ("q3", "c")]);
        let report = score(&def, &answers(&[("q1", "a"), ("q2", "b"), ("q3", "wrong")]));
        assert_eq!(report.correct_count, 2);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.percent, 67);
    }

    #[test]
    fn test_one_of_three_rounds_down_to_33() {
        let def = definition(&[("q1", "a"), ("q2", "b"), ("q3", "c")]);
        let report = score(&def, &answers(&[("q1", "a")]));
        assert_eq!(report.percent, 33);
    }

    #[test]
    fn test_half_rounds_up() {
        let def = definition(&[("q1", "a"), ("q2", "b"), ("q3", "c"), ("q4", "d"), ("q5", "e"), ("q6", "f"), ("q7", "g"), ("q8", "h")]);
        // 1/8 = 12.5 -> 13
        let report = score(&def, &answers(&[("q1", "a")]));
        assert_eq!(report.percent, 13);
    }

    #[test]
    fn test_unanswered_counts_as_incorrect() {
        let def = definition(&[("q1", "a"), ("q2", "b")]);
        let report = score(&def, &HashMap::new());
        assert_eq!(report.correct_count, 0);
        assert_eq!(report.total_count, 2);
        assert_eq!(report.percent, 0);
    }

    #[test]
    fn test_comparison_is_exact_and_case_sensitive() {
        let def = definition(&[("q1", "Paris"), ("q2", "Paris")]);
        let report = score(&def, &answers(&[("q1", "paris"), ("q2", " Paris")]));
        assert_eq!(report.correct_count, 0);
    }

    #[test]
    fn test_empty_definition_scores_zero() {
        let def = definition(&[]);
        let report = score(&def, &HashMap::new());
        assert_eq!(report.total_count, 0);
        assert_eq!(report.percent, 0);
    }

    #[test]
    fn test_same_inputs_same_report() {
        let def = definition(&[("q1", "a"), ("q2", "b"), ("q3", "c")]);
        let given = answers(&[("q1", "a"), ("q3", "nope")]);
        let first = score(&def, &given);
        let second = score(&def, &given);
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_correct_is_100() {
        let def = definition(&[("q1", "a"), ("q2", "b")]);
        let report = score(&def, &answers(&[("q1", "a"), ("q2", "b")]));
        assert_eq!(report.percent, 100);
    }
}
