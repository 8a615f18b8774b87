//! Integration tests for the session server and bot client
//!
//! These tests drive whole sessions across crate boundaries, both on a
//! manual clock and over real TCP connections.

use assert_approx_eq::assert_approx_eq;
use client::network::{BotOptions, Client};
use client::player::{play_offline, AutoPlayer};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use server::config::SessionConfig;
use server::error::SessionError;
use server::network::{Server, ServerMessage};
use server::orchestrator::SessionOrchestrator;
use server::timers::{ManualScheduler, TimerId, TimerKind};
use shared::codec::{read_packet, write_packet};
use shared::judge::{self, JudgmentTier};
use shared::{
    pattern, JudgmentCounts, MiniGameKind, Packet, RoundOutcome, SessionState,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

type Session = SessionOrchestrator<ManualScheduler>;

fn session(config: SessionConfig, seed: u64) -> Session {
    SessionOrchestrator::with_rng(config, ManualScheduler::new(), StdRng::seed_from_u64(seed))
}

fn outcome(participant_id: &str, kind: MiniGameKind, score: u32, elapsed_ms: u64) -> RoundOutcome {
    RoundOutcome {
        participant_id: participant_id.to_string(),
        kind,
        success: true,
        score,
        elapsed_ms,
        judgments: JudgmentCounts::default(),
    }
}

/// Votes, waits out the voting window and returns the selected kind
fn vote_and_open_round(session: &mut Session, votes: &[(&str, MiniGameKind)]) -> MiniGameKind {
    for (id, kind) in votes {
        assert_ok!(session.cast_vote(id, kind.as_str()));
    }
    let voting = session.config().voting_duration;
    session.advance(voting);
    assert_eq!(session.state(), SessionState::RoundActive);
    session.active_kind().unwrap()
}

/// SESSION FLOW TESTS
mod session_flow_tests {
    use super::*;

    /// Majority vote decides the round's mini-game
    #[tokio::test]
    async fn majority_vote_selects_kind() {
        let mut session = session(SessionConfig::default(), 1);
        for id in ["p1", "p2", "p3"] {
            session.join(id, "");
        }
        assert_ok!(session.start_voting());

        let selected = vote_and_open_round(
            &mut session,
            &[
                ("p1", MiniGameKind::Gyeokdol),
                ("p2", MiniGameKind::Gyeokdol),
                ("p3", MiniGameKind::StarForce),
            ],
        );
        assert_eq!(selected, MiniGameKind::Gyeokdol);
        assert_eq!(session.round_index(), 1);
        assert_eq!(
            session.current_pattern().map(|p| p.kind),
            Some(MiniGameKind::Gyeokdol)
        );
    }

    /// Every tied kind is reachable and nothing outside the tie is picked
    #[tokio::test]
    async fn tie_break_reaches_every_tied_kind() {
        let mut seen = BTreeSet::new();
        for seed in 0..200 {
            let mut session = session(SessionConfig::default(), seed);
            session.join("p1", "");
            session.join("p2", "");
            assert_ok!(session.start_voting());
            let selected = vote_and_open_round(
                &mut session,
                &[
                    ("p1", MiniGameKind::AjaePattern),
                    ("p2", MiniGameKind::StarForce),
                ],
            );
            seen.insert(selected);
        }

        assert!(seen.contains(&MiniGameKind::AjaePattern));
        assert!(seen.contains(&MiniGameKind::StarForce));
        assert!(!seen.contains(&MiniGameKind::Gyeokdol));
    }

    /// Nobody voting still selects one of the kinds when the window closes
    #[tokio::test]
    async fn empty_vote_still_selects() {
        let mut session = session(SessionConfig::default(), 3);
        session.join("p1", "");
        assert_ok!(session.start_voting());
        session.advance(Duration::from_secs(15));

        assert_eq!(session.state(), SessionState::RoundActive);
        assert!(session.active_kind().is_some());
    }

    /// Playing every round ends the session; reset zeroes all scores
    #[tokio::test]
    async fn full_session_ends_and_resets() {
        let config = SessionConfig {
            max_rounds: 2,
            ..SessionConfig::default()
        };
        let inter_round = config.inter_round_delay;
        let final_delay = config.final_results_delay;
        let mut session = session(config, 4);
        session.join("p1", "Ann");
        session.join("p2", "Bo");
        assert_ok!(session.start_voting());

        for round in 1..=2 {
            let kind = vote_and_open_round(
                &mut session,
                &[("p1", MiniGameKind::Gyeokdol), ("p2", MiniGameKind::Gyeokdol)],
            );
            assert_ok!(session.submit_result(outcome("p1", kind, 300, 9_000)));
            assert_ok!(session.submit_result(outcome("p2", kind, 200, 9_000)));
            assert_eq!(session.state(), SessionState::Scoring);
            assert_eq!(session.round_results()[&round].len(), 2);

            if round < 2 {
                session.advance(inter_round);
                assert_eq!(session.state(), SessionState::Voting);
            }
        }

        session.advance(final_delay);
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.participants().get("p1").unwrap().score, 6);
        assert_eq!(session.participants().get("p2").unwrap().score, 4);

        let ended = session
            .take_broadcasts()
            .into_iter()
            .find_map(|packet| match packet {
                Packet::GameEnded { ranking, .. } => Some(ranking),
                _ => None,
            })
            .unwrap();
        assert_eq!(ended[0].participant_id, "p1");
        assert_eq!(ended[0].score, 6);

        assert_eq!(session.start_voting(), Err(SessionError::AlreadyEnded));
        assert_err!(session.cast_vote("p1", "gyeokdol"));

        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.round_index(), 0);
        assert!(session.round_results().is_empty());
        assert!(session.participants().iter().all(|p| p.score == 0));
        assert_eq!(session.participants().len(), 2);
    }

    /// A silent participant does not stall the round; they place last
    #[tokio::test]
    async fn submission_timeout_closes_round() {
        let mut session = session(SessionConfig::default(), 5);
        session.join("p1", "");
        session.join("p2", "");
        assert_ok!(session.start_voting());
        let kind = vote_and_open_round(&mut session, &[("p1", MiniGameKind::StarForce)]);

        assert_ok!(session.submit_result(outcome("p1", kind, 120, 4_000)));
        assert_eq!(session.state(), SessionState::RoundActive);

        let limit = Duration::from_millis(u64::from(
            session.current_pattern().unwrap().time_limit_ms,
        ));
        let grace = session.config().submission_timeout;
        session.advance(limit + grace);

        assert_eq!(session.state(), SessionState::Scoring);
        let results = &session.round_results()[&1];
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].participant_id, "p1");
        assert_eq!(results[0].points_awarded, 3);
        assert_eq!(results[1].participant_id, "p2");
        assert_eq!(results[1].points_awarded, 0);
        assert!(!results[1].submitted);
    }

    /// Submission order does not change the ranking
    #[tokio::test]
    async fn ranking_is_independent_of_submission_order() {
        let ids = ["p1", "p2", "p3", "p4"];
        let scores = [(300, 9_000), (300, 8_000), (150, 1_000), (300, 8_000)];
        let mut reference = None;

        for seed in 0..6 {
            let mut session = session(SessionConfig::default(), 6);
            for id in ids {
                session.join(id, "");
            }
            assert_ok!(session.start_voting());
            let kind = vote_and_open_round(&mut session, &[("p1", MiniGameKind::Gyeokdol)]);

            let mut order: Vec<usize> = (0..ids.len()).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));
            for i in order {
                let (score, elapsed) = scores[i];
                assert_ok!(session.submit_result(outcome(ids[i], kind, score, elapsed)));
            }

            let ranked: Vec<String> = session.round_results()[&1]
                .iter()
                .map(|entry| entry.participant_id.clone())
                .collect();
            match &reference {
                None => reference = Some(ranked),
                Some(expected) => assert_eq!(&ranked, expected),
            }
        }

        assert_eq!(
            reference.unwrap(),
            vec!["p2", "p4", "p1", "p3"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }
}

/// EVENT HANDLING TESTS
mod event_tests {
    use super::*;

    /// Repeating a vote never adds more than one to the tally
    #[tokio::test]
    async fn repeated_vote_counts_once() {
        let mut session = session(SessionConfig::default(), 7);
        session.join("p1", "");
        session.join("p2", "");
        assert_ok!(session.start_voting());

        assert_ok!(session.cast_vote("p1", "gyeokdol"));
        assert_ok!(session.cast_vote("p1", "gyeokdol"));
        assert_eq!(session.tally()[&MiniGameKind::Gyeokdol], 1);

        assert_ok!(session.cast_vote("p1", "starforce"));
        assert_eq!(session.tally()[&MiniGameKind::Gyeokdol], 0);
        assert_eq!(session.tally()[&MiniGameKind::StarForce], 1);
        assert_eq!(session.tally().values().sum::<u32>(), 1);
    }

    /// Rejected events leave the session untouched
    #[tokio::test]
    async fn invalid_events_are_rejected() {
        let mut session = session(SessionConfig::default(), 8);
        session.join("p1", "");

        assert_eq!(session.cast_vote("p1", "gyeokdol"), Err(SessionError::NotVoting));
        assert_eq!(
            session.submit_result(outcome("p1", MiniGameKind::Gyeokdol, 1, 1)),
            Err(SessionError::NoActiveRound)
        );

        assert_ok!(session.start_voting());
        assert_eq!(
            session.cast_vote("p1", "tetris"),
            Err(SessionError::InvalidVoteTarget("tetris".to_string()))
        );
        assert!(matches!(
            session.start_voting(),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert_eq!(session.state(), SessionState::Voting);
        assert_eq!(session.tally().values().sum::<u32>(), 0);
    }

    /// A fire from a timer that has since been replaced does nothing
    #[tokio::test]
    async fn stale_timer_is_ignored() {
        let mut session = session(SessionConfig::default(), 9);
        session.join("p1", "");
        assert_ok!(session.start_voting());

        session.on_timer(TimerId {
            kind: TimerKind::VotingDeadline,
            generation: 0,
        });
        assert_eq!(session.state(), SessionState::Voting);

        session.on_timer(TimerId {
            kind: TimerKind::SubmissionDeadline,
            generation: u64::MAX,
        });
        assert_eq!(session.state(), SessionState::Voting);
    }

    /// Leaving during voting withdraws the vote and can close voting early
    #[tokio::test]
    async fn leave_during_voting_withdraws_vote() {
        let mut session = session(SessionConfig::default(), 10);
        for id in ["p1", "p2", "p3"] {
            session.join(id, "");
        }
        assert_ok!(session.start_voting());
        assert_ok!(session.cast_vote("p1", "starforce"));
        assert_ok!(session.cast_vote("p2", "gyeokdol"));

        assert_ok!(session.leave("p2"));
        assert_eq!(session.tally()[&MiniGameKind::Gyeokdol], 0);
        assert!(!session.participants().contains("p2"));

        // p3 is now the only one missing a vote
        assert_ok!(session.cast_vote("p3", "starforce"));
        session.advance(session.config().early_close_floor);
        assert_eq!(session.state(), SessionState::RoundActive);
        assert_eq!(session.active_kind(), Some(MiniGameKind::StarForce));
    }

    /// Returning within the reconnect grace keeps the participant and score
    #[tokio::test]
    async fn reconnect_within_grace_keeps_participant() {
        let mut session = session(SessionConfig::default(), 11);
        session.join("p1", "Ann");
        session.join("p2", "Bo");

        assert_ok!(session.participant_disconnected("p1"));
        assert!(!session.participants().is_live("p1"));
        session.advance(Duration::from_secs(5));
        session.join("p1", "");

        session.advance(Duration::from_secs(30));
        assert!(session.participants().is_live("p1"));
        assert_eq!(session.participants().get("p1").unwrap().name, "Ann");

        assert_ok!(session.participant_disconnected("p2"));
        session.advance(session.config().reconnect_grace);
        assert!(!session.participants().contains("p2"));
    }

    /// Everyone leaving mid-session returns it to Idle
    #[tokio::test]
    async fn empty_lobby_resets_session() {
        let mut session = session(SessionConfig::default(), 12);
        session.join("p1", "");
        assert_ok!(session.start_voting());
        session.advance(Duration::from_secs(15));
        assert_eq!(session.state(), SessionState::RoundActive);

        assert_ok!(session.participant_disconnected("p1"));
        session.advance(session.config().empty_lobby_reset);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.round_index(), 0);
    }

    /// Late joiners are handed the current phase and the round waits for them
    #[tokio::test]
    async fn late_joiner_catches_up() {
        let mut session = session(SessionConfig::default(), 13);
        session.join("p1", "");
        assert_ok!(session.start_voting());
        session.advance(Duration::from_secs(15));

        session.join("late", "");
        let packets = session.catch_up();
        assert!(packets
            .iter()
            .any(|packet| matches!(packet, Packet::RoundInit { round: 1, .. })));

        let kind = session.active_kind().unwrap();
        assert_ok!(session.submit_result(outcome("p1", kind, 50, 5_000)));
        assert_eq!(session.state(), SessionState::RoundActive);

        assert_ok!(session.submit_result(outcome("late", kind, 70, 6_000)));
        assert_eq!(session.state(), SessionState::Scoring);
        let ranked: Vec<&str> = session.round_results()[&1]
            .iter()
            .map(|entry| entry.participant_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["late", "p1"]);
    }

    /// Someone who joins mid-round and never reports places last at the deadline
    #[tokio::test]
    async fn late_joiner_ranked_as_non_submitter() {
        let mut session = session(SessionConfig::default(), 15);
        session.join("p1", "");
        assert_ok!(session.start_voting());
        session.advance(Duration::from_secs(15));
        let kind = session.active_kind().unwrap();
        let limit = Duration::from_millis(u64::from(
            session.current_pattern().unwrap().time_limit_ms,
        ));
        let grace = session.config().submission_timeout;

        session.advance(Duration::from_secs(4));
        session.join("late", "");
        assert_ok!(session.submit_result(outcome("p1", kind, 50, 5_000)));
        assert_eq!(session.state(), SessionState::RoundActive);

        // The deadline moved out to give the late joiner a full round
        session.advance(limit + grace - Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::RoundActive);
        session.advance(Duration::from_secs(4));
        assert_eq!(session.state(), SessionState::Scoring);

        let results = &session.round_results()[&1];
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].participant_id, "p1");
        assert_eq!(results[0].points_awarded, 3);
        assert_eq!(results[1].participant_id, "late");
        assert!(!results[1].submitted);
        assert_eq!(results[1].points_awarded, 0);
        assert_eq!(results[1].score, 0);
    }

    /// Identifying while results are on screen replays the last round's results
    #[tokio::test]
    async fn joiner_during_scoring_sees_results() {
        let mut session = session(SessionConfig::default(), 16);
        session.join("p1", "");
        assert_ok!(session.start_voting());
        session.advance(Duration::from_secs(15));
        let kind = session.active_kind().unwrap();
        assert_ok!(session.submit_result(outcome("p1", kind, 50, 5_000)));

        session.join("viewer", "");
        let replayed = session.catch_up().into_iter().find_map(|packet| match packet {
            Packet::RoundEnded { round, results } => Some((round, results)),
            _ => None,
        });
        let (round, results) = replayed.unwrap();
        assert_eq!(round, 1);
        assert_eq!(results[0].participant_id, "p1");
    }
}

/// GAMEPLAY TESTS
mod gameplay_tests {
    use super::*;

    /// Acting exactly on the target judges Perfect
    #[tokio::test]
    async fn action_on_target_is_perfect() {
        let scale = judge::visual_scale(judge::progress(1000.0, 1000.0));
        assert_approx_eq!(scale, 1.0);
        assert_eq!(judge::judge_action(1000.0, 1000.0), JudgmentTier::Perfect);
        assert_approx_eq!(judge::visual_scale(judge::progress(1000.0, 0.0)), 3.0);
    }

    /// Bots playing the server's pattern produce results the server accepts
    #[tokio::test]
    async fn offline_play_feeds_the_session() {
        let mut session = session(SessionConfig::default(), 14);
        session.join("p1", "");
        session.join("p2", "");
        assert_ok!(session.start_voting());
        vote_and_open_round(
            &mut session,
            &[("p1", MiniGameKind::Gyeokdol), ("p2", MiniGameKind::Gyeokdol)],
        );

        let spec = session.current_pattern().unwrap().clone();
        let sharp = play_offline(
            "p1",
            spec.clone(),
            &mut AutoPlayer::new(0, StdRng::seed_from_u64(1)),
            16.0,
        );
        let sloppy = play_offline(
            "p2",
            spec,
            &mut AutoPlayer::new(700, StdRng::seed_from_u64(2)),
            16.0,
        );
        assert_ok!(session.submit_result(sloppy));
        assert_ok!(session.submit_result(sharp));

        let results = &session.round_results()[&1];
        assert_eq!(results[0].participant_id, "p1");
        assert_eq!(results[0].points_awarded, 3);
        assert_eq!(results[1].points_awarded, 2);
    }

    /// Patterns are reproducible from a seed and get harder later on
    #[tokio::test]
    async fn patterns_scale_with_round() {
        let early = pattern::for_round(MiniGameKind::Gyeokdol, 1, &mut StdRng::seed_from_u64(3));
        let again = pattern::for_round(MiniGameKind::Gyeokdol, 1, &mut StdRng::seed_from_u64(3));
        let late = pattern::for_round(MiniGameKind::Gyeokdol, 5, &mut StdRng::seed_from_u64(3));

        assert_eq!(early, again);
        assert!(late.len() >= early.len());
        let shortest = |spec: &shared::PatternSpec| {
            spec.cues.iter().map(|cue| cue.duration_ms).min().unwrap_or(0)
        };
        assert!(shortest(&late) <= shortest(&early));
    }
}

/// NETWORK TESTS
mod network_tests {
    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            max_rounds: 2,
            voting_duration: Duration::from_secs(1),
            early_close_floor: Duration::from_millis(200),
            submission_timeout: Duration::from_secs(3),
            inter_round_delay: Duration::from_millis(500),
            final_results_delay: Duration::from_millis(500),
            auto_start_players: 2,
            ..SessionConfig::default()
        }
    }

    /// Two bots play a whole session against a live server
    #[tokio::test]
    async fn bots_complete_a_session_over_tcp() {
        let mut server = Server::new("127.0.0.1:0", fast_config()).await.unwrap();
        let addr = server.local_addr().to_string();
        let handle = server.handle();
        let server_task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut bots = Vec::new();
        for (i, id) in ["alpha", "beta"].into_iter().enumerate() {
            let addr = addr.clone();
            let mut options = BotOptions::new(id);
            options.vote = Some(MiniGameKind::AjaePattern);
            options.jitter_ms = 20;
            options.seed = Some(i as u64);
            bots.push(tokio::spawn(async move {
                let mut client = Client::connect(&addr, options).await.unwrap();
                let ranking = client.run().await.unwrap();
                (ranking, client.rounds_played())
            }));
        }

        for bot in bots {
            let (ranking, rounds_played) = timeout(Duration::from_secs(30), bot)
                .await
                .expect("session did not finish in time")
                .unwrap();
            let ranking = ranking.expect("server closed before the session ended");
            assert_eq!(ranking.len(), 2);
            assert_eq!(ranking.iter().map(|s| s.score).sum::<u32>(), 10);
            assert_eq!(rounds_played, 2);
        }

        handle.send(ServerMessage::Shutdown).unwrap();
        server_task.await.unwrap();
    }

    /// Rejected events come back as a status message on the same connection
    #[tokio::test]
    async fn rejected_vote_reports_status() {
        let mut server = Server::new("127.0.0.1:0", SessionConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        let server_task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_packet(
            &mut stream,
            &Packet::Identify {
                participant_id: "p1".to_string(),
                name: "Ann".to_string(),
            },
        )
        .await
        .unwrap();
        write_packet(
            &mut stream,
            &Packet::Vote {
                game_mode: "gyeokdol".to_string(),
            },
        )
        .await
        .unwrap();

        let status = timeout(Duration::from_secs(5), async {
            loop {
                if let Packet::Status { message } = read_packet(&mut stream).await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status, SessionError::NotVoting.to_string());

        handle.send(ServerMessage::Shutdown).unwrap();
        server_task.await.unwrap();
    }
}
