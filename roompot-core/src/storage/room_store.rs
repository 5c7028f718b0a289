use crate::error::{Result, RoomError};
use crate::storage::{amount_from_sql, amount_to_sql, from_millis, parse_column, to_millis, Storage};
use crate::types::{Amount, Room, RoomStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const ROOM_COLUMNS: &str = "id, ledger_room_id, name, game_id, creator_id, entry_fee, currency,
    capacity, min_players, current_players, is_private, join_code, is_sponsored, sponsor_amount,
    split_rule, start_time, end_time, actual_start_time, actual_end_time, status, prize_pool,
    platform_fee_collected, needs_reconciliation, reconciliation_reason, created_at";

pub struct RoomStore<'a> {
    storage: &'a Storage,
}

impl<'a> RoomStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn load_room(&self, room_id: &str) -> Result<Room> {
        let conn = self.storage.get_connection().await;
        load_room(&conn, room_id)
    }

    pub async fn list_rooms(&self, status: Option<RoomStatus>) -> Result<Vec<Room>> {
        let conn = self.storage.get_connection().await;
        list_rooms(&conn, status)
    }

    /// Rooms still open whose end time has passed.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Room>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rooms
             WHERE status IN ('waiting', 'ongoing') AND end_time <= ?1
               AND needs_reconciliation = 0
             ORDER BY end_time ASC",
            ROOM_COLUMNS
        ))?;

        let rooms = stmt
            .query_map(params![to_millis(now)], room_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// Waiting rooms whose start time has passed with enough players seated.
    pub async fn list_due_to_start(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT id FROM rooms
             WHERE status = 'waiting' AND start_time <= ?1 AND end_time > ?1
               AND current_players >= min_players
             ORDER BY start_time ASC",
        )?;

        let ids = stmt
            .query_map(params![to_millis(now)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub async fn list_pending_reconciliation(&self) -> Result<Vec<Room>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rooms WHERE needs_reconciliation = 1 ORDER BY created_at ASC",
            ROOM_COLUMNS
        ))?;

        let rooms = stmt
            .query_map([], room_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    pub async fn flag_reconciliation(&self, room_id: &str, reason: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;
        flag_reconciliation(&conn, room_id, reason)
    }

    pub async fn clear_reconciliation(&self, room_id: &str) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let updated = conn.execute(
            "UPDATE rooms SET needs_reconciliation = 0, reconciliation_reason = NULL
             WHERE id = ?1 AND needs_reconciliation = 1",
            params![room_id],
        )?;
        Ok(updated > 0)
    }

    /// Increment the seat counter only while the room is waiting and below capacity.
    pub async fn reserve_seat(&self, room_id: &str) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let updated = conn.execute(
            "UPDATE rooms SET current_players = current_players + 1
             WHERE id = ?1 AND status = 'waiting' AND current_players < capacity",
            params![room_id],
        )?;
        Ok(updated > 0)
    }

    pub async fn release_seat(&self, room_id: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;
        release_seat(&conn, room_id)
    }

    pub async fn set_ledger_room_id(&self, room_id: &str, ledger_room_id: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "UPDATE rooms SET ledger_room_id = ?1 WHERE id = ?2 AND ledger_room_id IS NULL",
            params![ledger_room_id, room_id],
        )?;
        Ok(())
    }

    /// Flip `waiting -> ongoing` once the start time has passed and enough players joined.
    pub async fn mark_ongoing(&self, room_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let updated = conn.execute(
            "UPDATE rooms SET status = 'ongoing', actual_start_time = ?1
             WHERE id = ?2 AND status = 'waiting' AND start_time <= ?1
               AND current_players >= min_players",
            params![to_millis(now), room_id],
        )?;
        Ok(updated > 0)
    }
}

pub(crate) fn insert_room(conn: &Connection, room: &Room) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO rooms ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            ROOM_COLUMNS
        ),
        params![
            room.id,
            room.ledger_room_id,
            room.name,
            room.game_id,
            room.creator_id,
            amount_to_sql(room.entry_fee),
            room.currency,
            room.capacity,
            room.min_players,
            room.current_players,
            room.is_private,
            room.join_code,
            room.is_sponsored,
            amount_to_sql(room.sponsor_amount),
            room.split_rule,
            to_millis(room.start_time),
            to_millis(room.end_time),
            room.actual_start_time.map(to_millis),
            room.actual_end_time.map(to_millis),
            room.status.as_str(),
            amount_to_sql(room.prize_pool),
            amount_to_sql(room.platform_fee_collected),
            room.needs_reconciliation,
            room.reconciliation_reason,
            to_millis(room.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_room(conn: &Connection, room_id: &str) -> Result<Room> {
    conn.query_row(
        &format!("SELECT {} FROM rooms WHERE id = ?1", ROOM_COLUMNS),
        params![room_id],
        room_from_row,
    )
    .optional()?
    .ok_or_else(|| RoomError::room_not_found(room_id))
}

pub(crate) fn list_rooms(conn: &Connection, status: Option<RoomStatus>) -> Result<Vec<Room>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rooms WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC",
        ROOM_COLUMNS
    ))?;

    let rooms = stmt
        .query_map(params![status.map(|s| s.as_str())], room_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rooms)
}

pub(crate) fn release_seat(conn: &Connection, room_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET current_players = current_players - 1
         WHERE id = ?1 AND current_players > 0",
        params![room_id],
    )?;
    Ok(())
}

pub(crate) fn add_to_pool(conn: &Connection, room_id: &str, amount: Amount) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET prize_pool = prize_pool + ?1 WHERE id = ?2",
        params![amount_to_sql(amount), room_id],
    )?;
    Ok(())
}

pub(crate) fn remove_from_pool(conn: &Connection, room_id: &str, amount: Amount) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET prize_pool = MAX(prize_pool - ?1, 0) WHERE id = ?2",
        params![amount_to_sql(amount), room_id],
    )?;
    Ok(())
}

pub(crate) fn flag_reconciliation(conn: &Connection, room_id: &str, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET needs_reconciliation = 1, reconciliation_reason = ?1 WHERE id = ?2",
        params![reason, room_id],
    )?;
    Ok(())
}

/// Conditional terminal transition. Returns false when another writer got there first.
///
/// Cancellation is only legal from `waiting`; completion from `waiting` or `ongoing`.
pub(crate) fn claim_terminal(
    conn: &Connection,
    room_id: &str,
    to: RoomStatus,
    now: DateTime<Utc>,
    prize_pool: Amount,
    platform_fee: Amount,
) -> Result<bool> {
    let guard = match to {
        RoomStatus::Cancelled => "status = 'waiting'",
        RoomStatus::Completed => "status IN ('waiting', 'ongoing')",
        other => {
            return Err(RoomError::internal(format!(
                "{} is not a terminal status",
                other
            )))
        }
    };

    let updated = conn.execute(
        &format!(
            "UPDATE rooms SET status = ?1, actual_end_time = ?2, prize_pool = ?3,
                platform_fee_collected = ?4
             WHERE id = ?5 AND {}",
            guard
        ),
        params![
            to.as_str(),
            to_millis(now),
            amount_to_sql(prize_pool),
            amount_to_sql(platform_fee),
            room_id,
        ],
    )?;
    Ok(updated > 0)
}

fn room_from_row(row: &Row) -> rusqlite::Result<Room> {
    let status: String = row.get(19)?;

    Ok(Room {
        id: row.get(0)?,
        ledger_room_id: row.get(1)?,
        name: row.get(2)?,
        game_id: row.get(3)?,
        creator_id: row.get(4)?,
        entry_fee: amount_from_sql(row.get(5)?),
        currency: row.get(6)?,
        capacity: row.get(7)?,
        min_players: row.get(8)?,
        current_players: row.get(9)?,
        is_private: row.get(10)?,
        join_code: row.get(11)?,
        is_sponsored: row.get(12)?,
        sponsor_amount: amount_from_sql(row.get(13)?),
        split_rule: row.get(14)?,
        start_time: from_millis(row.get(15)?),
        end_time: from_millis(row.get(16)?),
        actual_start_time: row.get::<_, Option<i64>>(17)?.map(from_millis),
        actual_end_time: row.get::<_, Option<i64>>(18)?.map(from_millis),
        status: parse_column(&status, 19, "status")?,
        prize_pool: amount_from_sql(row.get(20)?),
        platform_fee_collected: amount_from_sql(row.get(21)?),
        needs_reconciliation: row.get(22)?,
        reconciliation_reason: row.get(23)?,
        created_at: from_millis(row.get(24)?),
    })
}
