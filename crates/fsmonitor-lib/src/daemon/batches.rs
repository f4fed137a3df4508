//! The token-versioned event log.
//!
//! Changed paths accumulate in an append-only chain of batches, all keyed by
//! the current opaque token id. A client query walks the chain from the head
//! back to the client's sequence number, unions the paths it passes, and
//! freezes the head so the next change opens a fresh batch. Minting a new
//! token id (a resync) discards the chain and implicitly invalidates every
//! token previously handed out.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

/// Wire prefix shared by every token this daemon family has ever minted.
pub const TOKEN_HEADER: &str = "builtin";

/// The versioning coordinate handed between daemon and client.
///
/// `token_id` is opaque: equality is the only meaningful relation.
/// `sequence_nr` orders batches within one token id and never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub token_id: String,
    pub sequence_nr: u64,
}

impl Token {
    /// Parse the `builtin:<token_id>:<sequence_nr>` wire form. The token id
    /// may itself contain colons, so the sequence number is split off the
    /// right end.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(TOKEN_HEADER)?.strip_prefix(':')?;
        let (token_id, seq) = rest.rsplit_once(':')?;
        if token_id.is_empty() {
            return None;
        }
        Some(Self {
            token_id: token_id.to_owned(),
            sequence_nr: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_HEADER}:{}:{}", self.token_id, self.sequence_nr)
    }
}

/// One contiguous interval of observed changes. Closed batches are never
/// mutated again.
#[derive(Debug)]
struct Batch {
    seq: u64,
    paths: BTreeSet<String>,
}

impl Batch {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            paths: BTreeSet::new(),
        }
    }
}

/// The daemon's current token id plus its batch chain, newest first.
/// `chain[0]` is the head; it accepts new paths only while `head_open`.
#[derive(Debug)]
struct TokenData {
    id: String,
    chain: Vec<Batch>,
    head_open: bool,
}

impl TokenData {
    /// A fresh token starts with one open, empty batch at sequence 0, so
    /// the first query hands out `(id, 0)` and changes arriving after it
    /// land in batch 1.
    fn fresh(id: String) -> Self {
        Self {
            id,
            chain: vec![Batch::new(0)],
            head_open: true,
        }
    }

    fn head_seq(&self) -> u64 {
        self.chain.first().map(|b| b.seq).unwrap_or(0)
    }

    fn tail_seq(&self) -> u64 {
        self.chain.last().map(|b| b.seq).unwrap_or(0)
    }

    fn token(&self) -> Token {
        Token {
            token_id: self.id.clone(),
            sequence_nr: self.head_seq(),
        }
    }
}

/// What the daemon tells a client that asked "what changed since T".
#[derive(Debug, PartialEq, Eq)]
pub struct QueryResult {
    /// The token the client should present next time.
    pub token: Token,
    /// Changed worktree-relative paths, deduplicated.
    pub paths: Vec<String>,
    /// The client's token was stale; it must assume everything changed.
    /// `paths` is empty.
    pub trivial: bool,
}

/// The token-versioned log. All mutation happens under one coarse mutex;
/// none of the operations block, so the lock is never held across I/O.
pub struct BatchLog {
    state: Mutex<TokenData>,
    token_serial: AtomicU64,
    test_tokens: bool,
}

impl BatchLog {
    /// Boot-time construction doubles as the first resync: it mints the
    /// initial token id.
    pub fn new(test_tokens: bool) -> Self {
        let log = Self {
            state: Mutex::new(TokenData::fresh(String::new())),
            token_serial: AtomicU64::new(0),
            test_tokens,
        };
        let id = log.mint_token_id();
        log.state.lock().unwrap().id = id;
        log
    }

    /// Record one changed path in the open head batch, opening a successor
    /// batch first if the head was frozen by a query.
    pub fn append(&self, path: String) {
        let mut state = self.state.lock().unwrap();
        if !state.head_open {
            let seq = state.head_seq() + 1;
            state.chain.insert(0, Batch::new(seq));
            state.head_open = true;
        }
        state.chain[0].paths.insert(path);
    }

    /// Answer a client query. The head is frozen in every case: the
    /// returned token names the head's sequence number, so later changes
    /// must open a new batch to sort after it.
    pub fn query(&self, client: &Token) -> QueryResult {
        let mut state = self.state.lock().unwrap();

        if client.token_id != state.id {
            // Stale token id: minted by an earlier daemon or before the last
            // resync. The client rescans from scratch.
            state.head_open = false;
            return QueryResult {
                token: state.token(),
                paths: Vec::new(),
                trivial: true,
            };
        }

        if client.sequence_nr > state.head_seq() {
            // A sequence number we never handed out. Treat the token as
            // stale rather than guessing.
            state.head_open = false;
            return QueryResult {
                token: state.token(),
                paths: Vec::new(),
                trivial: true,
            };
        }

        if client.sequence_nr < state.tail_seq() {
            // Batches the client never saw have been truncated away, so a
            // complete answer can no longer be proven.
            debug!(
                "client seq {} predates tail {}, answering trivially",
                client.sequence_nr,
                state.tail_seq()
            );
            state.head_open = false;
            return QueryResult {
                token: state.token(),
                paths: Vec::new(),
                trivial: true,
            };
        }

        let mut paths = BTreeSet::new();
        let mut stop = state.chain.len();
        for (i, batch) in state.chain.iter().enumerate() {
            if batch.seq <= client.sequence_nr {
                stop = i;
                break;
            }
            paths.extend(batch.paths.iter().cloned());
        }
        // Everything older than the stop batch has now been delivered to
        // every client we can still answer; the stop batch becomes the tail.
        state.chain.truncate(stop.saturating_add(1).max(1));
        state.head_open = false;

        QueryResult {
            token: state.token(),
            paths: paths.into_iter().collect(),
            trivial: false,
        }
    }

    /// Mint a fresh token id and discard the chain. Outstanding client
    /// tokens become stale; their next query is answered trivially.
    pub fn resync(&self) -> Token {
        let id = self.mint_token_id();
        let mut state = self.state.lock().unwrap();
        *state = TokenData::fresh(id);
        let token = state.token();
        debug!("resynced to token {token}");
        token
    }

    pub fn current_token(&self) -> Token {
        self.state.lock().unwrap().token()
    }

    fn mint_token_id(&self) -> String {
        let serial = self.token_serial.fetch_add(1, Ordering::SeqCst) + 1;
        if self.test_tokens {
            return format!("test_{serial:08}");
        }
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{seconds}.{}.{serial}", std::process::id())
    }

    #[cfg(test)]
    fn chain_seqs(&self) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .chain
            .iter()
            .map(|b| b.seq)
            .collect()
    }
}
