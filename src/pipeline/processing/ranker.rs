use crate::common::error::Result;
use crate::pipeline::processing::candidate::CandidateRecord;
use std::cmp::Ordering;

/// Ranking order: score descending, then vote count descending, then name
/// ascending. Total, so equal inputs always produce the same output order.
pub fn rank_order(a: &CandidateRecord, b: &CandidateRecord) -> Ordering {
    b.average_score
        .total_cmp(&a.average_score)
        .then_with(|| b.vote_count.cmp(&a.vote_count))
        .then_with(|| a.name.cmp(&b.name))
}

/// Materializes `candidates`, sorts them by [`rank_order`] and keeps the first
/// `top_n`.
pub fn select<I>(candidates: I, top_n: usize) -> Result<Vec<CandidateRecord>>
where
    I: IntoIterator<Item = Result<CandidateRecord>>,
{
    let mut all = candidates.into_iter().collect::<Result<Vec<_>>>()?;
    all.sort_by(rank_order);
    all.truncate(top_n);
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str, score: f64, votes: u64) -> CandidateRecord {
        CandidateRecord {
            external_id: id.to_string(),
            name: name.to_string(),
            release_date: None,
            duration_minutes: None,
            genres: Vec::new(),
            average_score: score,
            vote_count: votes,
            description: None,
            poster_url: None,
            director: None,
        }
    }

    fn ids(out: &[CandidateRecord]) -> Vec<&str> {
        out.iter().map(|c| c.external_id.as_str()).collect()
    }

    #[test]
    fn name_breaks_full_ties() {
        let out = select(
            vec![
                Ok(candidate("z", "Zeta", 9.0, 100)),
                Ok(candidate("a", "Alpha", 9.0, 100)),
            ],
            10,
        )
        .unwrap();
        assert_eq!(ids(&out), vec!["a", "z"]);
    }

    #[test]
    fn score_then_votes_order() {
        let out = select(
            vec![
                Ok(candidate("low", "A", 7.5, 900_000)),
                Ok(candidate("few", "B", 9.3, 80_000)),
                Ok(candidate("many", "C", 9.3, 90_000)),
            ],
            10,
        )
        .unwrap();
        assert_eq!(ids(&out), vec!["many", "few", "low"]);
    }

    #[test]
    fn truncates_to_top_n() {
        let input: Vec<_> = (0..20)
            .map(|i| Ok(candidate(&format!("tt{i}"), &format!("N{i:02}"), i as f64 / 2.0, 10)))
            .collect();
        let out = select(input, 5).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].external_id, "tt19");
        assert!(out.windows(2).all(|w| rank_order(&w[0], &w[1]) != Ordering::Greater));

        assert!(select(vec![Ok(candidate("x", "X", 1.0, 1))], 0).unwrap().is_empty());
    }

    #[test]
    fn upstream_errors_propagate() {
        let input = vec![
            Ok(candidate("x", "X", 1.0, 1)),
            Err(crate::common::error::ImporterError::MissingField("tconst".into())),
        ];
        assert!(select(input, 5).is_err());
    }
}
