#[cfg(test)]
mod tests {
    use super::super::test_utils::{chunk_str, delta, print_events, processor, snapshots, TestSink};
    use super::super::{StreamConfig, TurnOutcome};
    use crate::types::{DoneStatus, HostEvent, Patch};
    use crate::utils::offsets::OffsetEncoding;

    const RESPONSE: &str = concat!(
        "I'll tighten the introduction.\n\n",
        "<<<AGEAF_FILE_UPDATE path=\"chapters/intro.tex\">>>\n",
        "\\section{Intro}\nWe present a fast solver.\n",
        "<<<AGEAF_FILE_UPDATE_END>>>\n",
        "\nThe flow now reads:\n\n",
        "```ageaf-diagram\ngraph LR\n  A-->B\n```\n",
        "\nAnd for your selection:\n\n",
        "```ageaf-patch\n{\"kind\":\"replaceSelection\",\"text\":\"faster\"}\n```\n",
        "\nLet me know if you want more changes."
    );

    fn expected_events() -> Vec<HostEvent> {
        vec![
            delta("I'll tighten the introduction.\n\n"),
            HostEvent::FileStarted {
                file_path: "chapters/intro.tex".to_string(),
            },
            HostEvent::Patch(Patch::ReplaceRangeInFile {
                file_path: "chapters/intro.tex".to_string(),
                expected_old_text: "We present a solver.".to_string(),
                text: "We present a fast solver.".to_string(),
                from: 16,
                to: 36,
                line_from: Some(2),
            }),
            delta("\nThe flow now reads:\n\n```mermaid\ngraph LR\n  A-->B\n```\n\nAnd for your selection:\n\n"),
            HostEvent::Patch(Patch::ReplaceSelection {
                text: "faster".to_string(),
            }),
            delta("\nLet me know if you want more changes."),
            HostEvent::Done {
                status: DoneStatus::Ok,
                message: None,
            },
        ]
    }

    #[test]
    fn test_mixed_response_is_chunking_independent() {
        for chunk_size in 1..=13 {
            let sink = TestSink::new();
            let mut processor = processor(
                &sink,
                snapshots(&[("chapters/intro.tex", "\\section{Intro}\nWe present a solver.\n")]),
                StreamConfig::default(),
            );

            for chunk in chunk_str(RESPONSE, chunk_size) {
                processor.push_delta(&chunk).unwrap();
            }
            processor
                .finish(TurnOutcome::Completed { final_text: None })
                .unwrap();

            let events = sink.get_events();
            if events != expected_events() {
                print_events(&events);
            }
            assert_eq!(events, expected_events(), "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_non_ascii_offsets_follow_encoding() {
        let response = "<<<AGEAF_FILE_UPDATE path=\"greeting.tex\">>>\nGrüße 😀\nthere\n<<<AGEAF_FILE_UPDATE_END>>>";
        for (encoding, from, to) in [(OffsetEncoding::Utf16, 9, 14), (OffsetEncoding::Utf8, 13, 18)] {
            let sink = TestSink::new();
            let mut processor = processor(
                &sink,
                snapshots(&[("greeting.tex", "Grüße 😀\nworld\n")]),
                StreamConfig {
                    offset_encoding: encoding,
                    ..StreamConfig::default()
                },
            );
            for chunk in chunk_str(response, 1) {
                processor.push_delta(&chunk).unwrap();
            }
            processor
                .finish(TurnOutcome::Completed { final_text: None })
                .unwrap();

            let patches: Vec<Patch> = sink
                .get_raw_events()
                .into_iter()
                .filter_map(|event| match event {
                    HostEvent::Patch(patch) => Some(patch),
                    _ => None,
                })
                .collect();
            assert_eq!(
                patches,
                vec![Patch::ReplaceRangeInFile {
                    file_path: "greeting.tex".to_string(),
                    expected_old_text: "world".to_string(),
                    text: "there".to_string(),
                    from,
                    to,
                    line_from: Some(2),
                }],
                "{encoding:?}"
            );
        }
    }
}
