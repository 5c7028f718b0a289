use crate::error::{Result, RoomError};
use crate::storage::{amount_from_sql, amount_to_sql, from_millis, to_millis, Storage};
use crate::types::{Amount, Participant};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

const PARTICIPANT_COLUMNS: &str = "id, room_id, user_id, payment_currency, payment_amount, score,
    final_rank, earnings, active, joined_at, left_at, settled_at";

pub struct ParticipantStore<'a> {
    storage: &'a Storage,
}

impl<'a> ParticipantStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Active participants in join order.
    pub async fn active_participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        let conn = self.storage.get_connection().await;
        active_participants(&conn, room_id)
    }

    /// Every membership ever recorded for the room, including departed ones.
    pub async fn all_participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM participants WHERE room_id = ?1 ORDER BY joined_at ASC, id ASC",
            PARTICIPANT_COLUMNS
        ))?;

        let participants = stmt
            .query_map(params![room_id], participant_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(participants)
    }

    pub async fn find_active(&self, room_id: &str, user_id: &str) -> Result<Option<Participant>> {
        let conn = self.storage.get_connection().await;
        find_active(&conn, room_id, user_id)
    }

    /// How many memberships the user has had in this room so far.
    pub async fn membership_count(&self, room_id: &str, user_id: &str) -> Result<u32> {
        let conn = self.storage.get_connection().await;

        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM participants WHERE room_id = ?1 AND user_id = ?2",
            params![room_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn update_score(&self, room_id: &str, user_id: &str, score: i64) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let updated = conn.execute(
            "UPDATE participants SET score = ?1
             WHERE room_id = ?2 AND user_id = ?3 AND active = 1 AND settled_at IS NULL",
            params![score, room_id, user_id],
        )?;
        Ok(updated > 0)
    }
}

pub(crate) fn insert_participant(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
    currency: &str,
    payment: Amount,
    joined_at: DateTime<Utc>,
) -> Result<i64> {
    let inserted = conn.execute(
        "INSERT INTO participants (room_id, user_id, payment_currency, payment_amount, active, joined_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![
            room_id,
            user_id,
            currency,
            amount_to_sql(payment),
            to_millis(joined_at)
        ],
    );

    match inserted {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(RoomError::validation(format!(
                "{} is already in room {}",
                user_id, room_id
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn active_participants(conn: &Connection, room_id: &str) -> Result<Vec<Participant>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM participants WHERE room_id = ?1 AND active = 1
         ORDER BY joined_at ASC, id ASC",
        PARTICIPANT_COLUMNS
    ))?;

    let participants = stmt
        .query_map(params![room_id], participant_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(participants)
}

pub(crate) fn find_active(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
) -> Result<Option<Participant>> {
    let participant = conn
        .query_row(
            &format!(
                "SELECT {} FROM participants WHERE room_id = ?1 AND user_id = ?2 AND active = 1",
                PARTICIPANT_COLUMNS
            ),
            params![room_id, user_id],
            participant_from_row,
        )
        .optional()?;
    Ok(participant)
}

/// Flip one active membership to inactive. Returns false if it was already gone.
pub(crate) fn deactivate(
    conn: &Connection,
    participant_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE participants SET active = 0, left_at = ?1 WHERE id = ?2 AND active = 1",
        params![to_millis(now), participant_id],
    )?;
    Ok(updated > 0)
}

/// Record the settlement result. Non-winners get a null rank and zero earnings.
pub(crate) fn settle_participant(
    conn: &Connection,
    participant_id: i64,
    final_rank: Option<u32>,
    earnings: Amount,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE participants SET final_rank = ?1, earnings = ?2, settled_at = ?3
         WHERE id = ?4 AND settled_at IS NULL",
        params![final_rank, amount_to_sql(earnings), to_millis(now), participant_id],
    )?;
    Ok(())
}

fn participant_from_row(row: &Row) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        payment_currency: row.get(3)?,
        payment_amount: amount_from_sql(row.get(4)?),
        score: row.get(5)?,
        final_rank: row.get(6)?,
        earnings: amount_from_sql(row.get(7)?),
        active: row.get(8)?,
        joined_at: from_millis(row.get(9)?),
        left_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        settled_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
    })
}
